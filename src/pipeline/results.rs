//! Phase results and run metadata written to the artifacts directory.
//!
//! Every run leaves `junit_runner.xml`, a JUnit suite with one test case per
//! phase, and `metadata.json` describing which deployer and tester ran.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// File name of the JUnit report.
pub const JUNIT_FILE_NAME: &str = "junit_runner.xml";
/// File name of the run metadata.
pub const METADATA_FILE_NAME: &str = "metadata.json";

const SUITE_NAME: &str = "kt2";
const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Errors raised while persisting results.
#[derive(Debug, Error)]
pub enum ResultError {
    /// The artifacts directory or a result file could not be written.
    #[error("failed to write {path}: {message}")]
    Io {
        /// Path that failed.
        path: Utf8PathBuf,
        /// Underlying error text.
        message: String,
    },
    /// A result file could not be rendered.
    #[error("failed to render {file}: {message}")]
    Render {
        /// File being rendered.
        file: &'static str,
        /// Serializer message.
        message: String,
    },
}

/// Outcome of one pipeline phase.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseResult {
    /// Phase name, for example `Up`.
    pub name: String,
    /// Wall-clock time spent in the phase.
    pub duration: Duration,
    /// Failure message when the phase failed.
    pub failure: Option<String>,
}

/// Contents of `metadata.json`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct RunMetadata {
    /// Version of this tool.
    #[serde(rename = "kt2-version")]
    pub version: String,
    /// Deployer name.
    pub deployer: String,
    /// Tester name, empty when no tester ran.
    pub tester: String,
    /// Run identifier.
    #[serde(rename = "run-id")]
    pub run_id: String,
}

#[derive(Serialize)]
#[serde(rename = "testsuite")]
struct JunitSuite<'a> {
    #[serde(rename = "@name")]
    name: &'a str,
    #[serde(rename = "@tests")]
    tests: usize,
    #[serde(rename = "@failures")]
    failures: usize,
    #[serde(rename = "@time")]
    time: String,
    #[serde(rename = "testcase")]
    cases: Vec<JunitCase<'a>>,
}

#[derive(Serialize)]
struct JunitCase<'a> {
    #[serde(rename = "@name")]
    name: &'a str,
    #[serde(rename = "@classname")]
    classname: &'a str,
    #[serde(rename = "@time")]
    time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<JunitFailure<'a>>,
}

#[derive(Serialize)]
struct JunitFailure<'a> {
    #[serde(rename = "@message")]
    message: &'a str,
    #[serde(rename = "$text")]
    text: &'a str,
}

fn seconds(duration: Duration) -> String {
    format!("{:.3}", duration.as_secs_f64())
}

/// Collects phase outcomes and writes them out at the end of a run.
#[derive(Debug, Default)]
pub struct ResultWriter {
    phases: Vec<PhaseResult>,
    in_flight: Option<(String, Instant)>,
}

impl ResultWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as started, so it can still be recorded if the run is
    /// abandoned before it finishes.
    pub fn begin(&mut self, name: &str) {
        self.in_flight = Some((name.to_owned(), Instant::now()));
    }

    /// Records the phase still in flight, if any, as failed with `message`.
    pub fn abandon(&mut self, message: &str) {
        if let Some((name, started)) = self.in_flight.take() {
            self.record(&name, started.elapsed(), Some(message.to_owned()));
        }
    }

    /// Records one phase.
    pub fn record(&mut self, name: &str, duration: Duration, failure: Option<String>) {
        self.in_flight = None;
        self.phases.push(PhaseResult {
            name: name.to_owned(),
            duration,
            failure,
        });
    }

    /// Phases recorded so far, in order.
    #[must_use]
    pub fn phases(&self) -> &[PhaseResult] {
        &self.phases
    }

    /// Renders the JUnit report.
    ///
    /// # Errors
    ///
    /// Returns [`ResultError::Render`] when serialization fails.
    pub fn render_junit(&self) -> Result<String, ResultError> {
        let suite = JunitSuite {
            name: SUITE_NAME,
            tests: self.phases.len(),
            failures: self
                .phases
                .iter()
                .filter(|phase| phase.failure.is_some())
                .count(),
            time: seconds(self.phases.iter().map(|phase| phase.duration).sum()),
            cases: self
                .phases
                .iter()
                .map(|phase| JunitCase {
                    name: &phase.name,
                    classname: SUITE_NAME,
                    time: seconds(phase.duration),
                    failure: phase.failure.as_deref().map(|message| JunitFailure {
                        message,
                        text: message,
                    }),
                })
                .collect(),
        };
        let body = quick_xml::se::to_string(&suite).map_err(|err| ResultError::Render {
            file: JUNIT_FILE_NAME,
            message: err.to_string(),
        })?;
        Ok(format!("{XML_DECLARATION}{body}\n"))
    }

    /// Writes the JUnit report and `metadata` into `artifacts`, creating the
    /// directory when needed.
    ///
    /// # Errors
    ///
    /// Returns [`ResultError`] when rendering or writing fails.
    pub fn write(&self, artifacts: &Utf8Path, metadata: &RunMetadata) -> Result<(), ResultError> {
        let junit = self.render_junit()?;
        let rendered =
            serde_json::to_string_pretty(metadata).map_err(|err| ResultError::Render {
                file: METADATA_FILE_NAME,
                message: err.to_string(),
            })?;

        Dir::create_ambient_dir_all(artifacts, ambient_authority()).map_err(|err| {
            ResultError::Io {
                path: artifacts.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        let dir = Dir::open_ambient_dir(artifacts, ambient_authority()).map_err(|err| {
            ResultError::Io {
                path: artifacts.to_path_buf(),
                message: err.to_string(),
            }
        })?;
        for (name, contents) in [(JUNIT_FILE_NAME, junit), (METADATA_FILE_NAME, rendered)] {
            dir.write(name, contents).map_err(|err| ResultError::Io {
                path: artifacts.join(name),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    #[fixture]
    fn writer() -> ResultWriter {
        let mut writer = ResultWriter::new();
        writer.record("Up", Duration::from_millis(1500), None);
        writer.record(
            "Test",
            Duration::from_secs(2),
            Some(String::from("exit status 1 & <stderr>")),
        );
        writer
    }

    #[rstest]
    fn junit_has_one_case_per_phase(writer: ResultWriter) {
        let xml = writer.render_junit().expect("render");

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains(r#"<testsuite name="kt2" tests="2" failures="1" time="3.500">"#));
        assert!(xml.contains(r#"<testcase name="Up" classname="kt2" time="1.500""#));
        assert!(xml.contains("exit status 1 &amp; &lt;stderr&gt;"));
    }

    #[rstest]
    fn abandoned_phase_is_recorded_as_failed() {
        let mut writer = ResultWriter::new();
        writer.begin("Build");
        writer.record("Build", Duration::from_secs(1), None);
        writer.abandon("interrupted");
        assert_eq!(writer.phases().len(), 1);

        writer.begin("Up");
        writer.abandon("interrupted");

        let up = writer.phases().last().expect("Up recorded");
        assert_eq!(up.name, "Up");
        assert_eq!(up.failure.as_deref(), Some("interrupted"));
    }

    #[rstest]
    fn write_creates_artifacts_dir(writer: ResultWriter) {
        let temp = TempDir::new().expect("tempdir");
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).expect("utf8");
        let artifacts = root.join("nested/artifacts");
        let metadata = RunMetadata {
            version: String::from("0.1.0"),
            deployer: String::from("noop"),
            tester: String::from("exec"),
            run_id: String::from("abc"),
        };

        writer.write(&artifacts, &metadata).expect("written");

        let json: serde_json::Value = serde_json::from_str(
            &fs::read_to_string(artifacts.join(METADATA_FILE_NAME)).expect("metadata"),
        )
        .expect("json");
        assert_eq!(
            json.get("kt2-version").and_then(serde_json::Value::as_str),
            Some("0.1.0")
        );
        assert_eq!(
            json.get("run-id").and_then(serde_json::Value::as_str),
            Some("abc")
        );
        assert!(artifacts.join(JUNIT_FILE_NAME).is_file());
    }
}
