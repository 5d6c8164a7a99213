//! JSON-lines script runner.
//!
//! Reads one [`Request`] per line, runs it against the engine and writes
//! one [`Response`] per line. Requests run strictly in order.

use anyhow::{Context, Result};
use sightline_core::config::ConfigHandle;
use sightline_core::engine::Engine;
use sightline_core::error::ApiError;
use sightline_core::protocol::{Command, Request, Response, ResponseData};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Longest accepted request line.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScriptSummary {
    pub requests: usize,
    pub failed: usize,
}

impl ScriptSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

pub struct ScriptRunner<'a> {
    engine: &'a Engine,
    config: &'a mut ConfigHandle,
    stop_on_error: bool,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(engine: &'a Engine, config: &'a mut ConfigHandle, stop_on_error: bool) -> Self {
        Self {
            engine,
            config,
            stop_on_error,
        }
    }

    pub async fn run<R, W>(&mut self, mut reader: R, mut writer: W) -> Result<ScriptSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = ScriptSummary::default();
        let mut line = String::new();
        let mut line_no = 0usize;

        loop {
            line.clear();
            let bytes_read = read_line_bounded(&mut reader, &mut line, MAX_REQUEST_SIZE).await?;
            if bytes_read == 0 {
                break;
            }
            line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let response = match serde_json::from_str::<Request>(trimmed) {
                Ok(request) => self.handle(request).await,
                Err(e) => Response::error(
                    format!("line-{}", line_no),
                    ApiError::invalid_request(format!(
                        "Invalid JSON request on line {}: {}",
                        line_no, e
                    )),
                ),
            };

            summary.requests += 1;
            if !response.success {
                summary.failed += 1;
            }

            let json = serde_json::to_string(&response).context("Failed to serialize response")?;
            writer
                .write_all(json.as_bytes())
                .await
                .context("Failed to write response")?;
            writer.write_all(b"\n").await.context("Failed to write newline")?;
            writer.flush().await.context("Failed to flush")?;

            if !response.success && self.stop_on_error {
                warn!(id = %response.id, "stopping at first failed request");
                break;
            }
        }

        info!(
            requests = summary.requests,
            failed = summary.failed,
            "script finished"
        );
        Ok(summary)
    }

    async fn handle(&mut self, request: Request) -> Response {
        debug!(id = %request.id, command = ?request.command, "handling request");
        let id = request.id;

        match request.command {
            Command::Detect { descriptor } => {
                Response::detection(id, self.engine.detect(descriptor).await)
            }

            Command::Execute { step } => {
                Response::action(id, self.engine.execute_with_retry(step).await)
            }

            Command::Stats => Response::success(id, ResponseData::Stats(self.engine.telemetry())),

            Command::ClearCache => {
                self.engine.clear_cache();
                ok(id, "location cache cleared")
            }

            Command::ResetStats => {
                self.engine.reset_telemetry();
                ok(id, "telemetry reset")
            }

            Command::ReloadConfig { path } => match self.reload(path).await {
                Ok(true) => ok(id, "configuration reloaded"),
                Ok(false) => ok(id, "configuration unchanged"),
                Err(e) => Response::error(id, e),
            },
        }
    }

    /// Reload from `path`, or from the current file if it changed.
    async fn reload(&mut self, path: Option<std::path::PathBuf>) -> Result<bool, ApiError> {
        let config = match path {
            Some(path) => {
                let handle = ConfigHandle::load(path)?;
                let config = handle.config().clone();
                self.engine.reload_config(config).await?;
                *self.config = handle;
                return Ok(true);
            }
            None => self.config.reload_if_changed()?,
        };
        match config {
            Some(config) => {
                self.engine.reload_config(config).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn ok(id: String, message: &str) -> Response {
    Response::success(
        id,
        ResponseData::Ok {
            message: message.to_string(),
        },
    )
}

/// Read a line with a maximum size limit.
///
/// Returns the number of bytes read (0 means EOF).
async fn read_line_bounded<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader.fill_buf().await.context("Failed to read script")?;
        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let to_consume = newline_pos.map_or(available.len(), |p| p + 1);
        if total + to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        bytes.extend_from_slice(&available[..to_consume]);
        total += to_consume;
        reader.consume(to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in script")?;
    buf.push_str(line);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use image::{GrayImage, Rgba, RgbaImage};
    use sightline_core::config::Config;
    use sightline_core::engine::EngineParts;
    use sightline_core::frame::{Frame, StaticFrameSource};
    use sightline_core::geometry::Rect;
    use sightline_core::input::DryRunDriver;
    use sightline_core::template::TemplateDetector;
    use sightline_core::text::backend::{LineId, OcrBackend, OcrWord};
    use sightline_core::text::TextDetector;
    use tokio::io::BufReader;

    /// OCR that always sees one "OK" word.
    struct CannedOcr;

    impl OcrBackend for CannedOcr {
        fn name(&self) -> &str {
            "canned"
        }

        fn recognize(&self, _image: &GrayImage) -> sightline_core::error::Result<Vec<OcrWord>> {
            Ok(vec![OcrWord {
                text: "OK".into(),
                confidence: 95.0,
                bbox: Rect::new(50, 40, 30, 16),
                line: LineId {
                    block: 1,
                    paragraph: 1,
                    line: 1,
                },
            }])
        }
    }

    fn engine(dir: &std::path::Path) -> (Engine, Arc<DryRunDriver>) {
        let mut config = Config::default();
        config.template.template_directory = dir.join("templates");
        config.recovery.log_directory = dir.join("logs");
        config.automation.action_delay = std::time::Duration::ZERO;
        config.automation.retry_delay = std::time::Duration::ZERO;
        config.automation.screenshot_on_failure = false;

        let text = Arc::new(TextDetector::with_backends(
            &config.ocr,
            &config.debugging,
            Box::new(CannedOcr),
            None,
        ));
        let templates = Arc::new(TemplateDetector::load(&config.template).unwrap());
        let input = Arc::new(DryRunDriver::new());
        let frame = Frame::from_image(RgbaImage::from_pixel(200, 100, Rgba([240, 240, 240, 255])));
        let engine = Engine::with_parts(
            config,
            EngineParts {
                text,
                templates,
                frames: Arc::new(StaticFrameSource::new(frame)),
                input: input.clone(),
            },
        );
        (engine, input)
    }

    async fn run_script(
        engine: &Engine,
        script: &str,
        stop_on_error: bool,
    ) -> (ScriptSummary, Vec<Response>) {
        let mut config = ConfigHandle::defaults();
        let mut out = Vec::new();
        let summary = ScriptRunner::new(engine, &mut config, stop_on_error)
            .run(BufReader::new(script.as_bytes()), &mut out)
            .await
            .unwrap();
        let responses = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        (summary, responses)
    }

    #[tokio::test]
    async fn runs_requests_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, input) = engine(dir.path());
        let script = r#"
# find it, then click it
{"id":"1","command":{"action":"detect","descriptor":{"name":"ok","text_patterns":["OK"]}}}
{"id":"2","command":{"action":"execute","step":{"action_type":"click","target_text":"OK"}}}
{"id":"3","command":{"action":"stats"}}
{"id":"4","command":{"action":"clear_cache"}}
"#;
        let (summary, responses) = run_script(&engine, script, false).await;

        assert_eq!(summary, ScriptSummary { requests: 4, failed: 0 });
        let ids: Vec<_> = responses.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4"]);
        assert_eq!(input.events().len(), 2);
        match &responses[2].data {
            Some(ResponseData::Stats(stats)) => assert_eq!(stats.performance.total_operations, 1),
            other => panic!("expected stats, got {:?}", other),
        }
        assert_eq!(engine.cache_len(), 0);
    }

    #[tokio::test]
    async fn bad_lines_are_reported_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let script = "not json\n{\"id\":\"2\",\"command\":{\"action\":\"reset_stats\"}}\n";

        let (summary, responses) = run_script(&engine, script, false).await;
        assert_eq!(summary, ScriptSummary { requests: 2, failed: 1 });
        assert_eq!(responses[0].id, "line-1");
        assert!(responses[0].error.is_some());
        assert!(responses[1].success);
    }

    #[tokio::test]
    async fn stop_on_error_halts_the_script() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let script = r#"{"id":"1","command":{"action":"execute","step":{"action_type":"type","target_text":"OK"}}}
{"id":"2","command":{"action":"stats"}}
"#;
        let (summary, responses) = run_script(&engine, script, true).await;
        assert_eq!(summary.requests, 1);
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].success);
        assert!(!summary.all_succeeded());
    }

    #[tokio::test]
    async fn reload_without_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let script = r#"{"id":"r","command":{"action":"reload_config"}}"#;

        let (_, responses) = run_script(&engine, script, false).await;
        assert!(responses[0].success);
        assert_eq!(
            responses[0].data,
            Some(ResponseData::Ok {
                message: "configuration unchanged".into()
            })
        );
    }

    #[tokio::test]
    async fn reload_from_path_applies_it() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let path = dir.path().join("next.json");
        std::fs::write(&path, r#"{"automation":{"max_retries":9}}"#).unwrap();
        let script = format!(
            "{{\"id\":\"r\",\"command\":{{\"action\":\"reload_config\",\"path\":{}}}}}\n",
            serde_json::to_string(&path).unwrap()
        );

        let (_, responses) = run_script(&engine, &script, false).await;
        assert!(responses[0].success, "{:?}", responses[0].error);
        assert_eq!(engine.config().await.automation.max_retries, 9);
    }

    #[tokio::test]
    async fn oversized_line_is_rejected() {
        let data = vec![b'x'; 64];
        let mut reader = BufReader::with_capacity(8, data.as_slice());
        let mut buf = String::new();
        assert!(read_line_bounded(&mut reader, &mut buf, 16).await.is_err());
    }
}
