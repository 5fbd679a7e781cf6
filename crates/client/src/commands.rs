//! Built-in remote commands backed by the state sampler.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;

use crate::capture::CaptureReason;
use crate::registry::DesktopCommand;
use crate::sampler::StateSampler;
use crate::types::{CaptureError, CommandContext, CommandError, CommandResult};

fn capture_error(e: CaptureError) -> CommandError {
    match e {
        CaptureError::PermissionDenied(m) => CommandError::NotAllowed(m),
        CaptureError::Timeout => CommandError::Timeout("capture timed out".into()),
        other => CommandError::Failed(other.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ScreenshotParams {
    #[serde(default)]
    max_width: Option<u32>,
    #[serde(default)]
    max_height: Option<u32>,
}

/// `screenshot`: capture the screen and return it base64-encoded.
pub struct ScreenshotCommand {
    sampler: StateSampler,
}

impl ScreenshotCommand {
    pub fn new(sampler: StateSampler) -> Self {
        Self { sampler }
    }
}

#[async_trait::async_trait]
impl DesktopCommand for ScreenshotCommand {
    async fn call(&self, ctx: CommandContext, params: serde_json::Value) -> CommandResult {
        let params: ScreenshotParams = if params.is_null() {
            ScreenshotParams::default()
        } else {
            serde_json::from_value(params).map_err(|e| CommandError::InvalidArgs(e.to_string()))?
        };

        let image = tokio::select! {
            r = self.sampler.capture_screenshot(params.max_width, params.max_height) => r,
            _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled("shutting down".into())),
        }
        .map_err(capture_error)?;

        Ok(json!({
            "screenshot_base64": BASE64.encode(&image.png),
            "width": image.width,
            "height": image.height,
            "format": "png",
        }))
    }
}

/// `capture_state`: take a fresh desktop snapshot and return it.
pub struct CaptureStateCommand {
    sampler: StateSampler,
}

impl CaptureStateCommand {
    pub fn new(sampler: StateSampler) -> Self {
        Self { sampler }
    }
}

#[async_trait::async_trait]
impl DesktopCommand for CaptureStateCommand {
    async fn call(&self, ctx: CommandContext, _params: serde_json::Value) -> CommandResult {
        let state = tokio::select! {
            r = self.sampler.capture_bounded(CaptureReason::Command) => r,
            _ = ctx.cancel.cancelled() => return Err(CommandError::Cancelled("shutting down".into())),
        }
        .map_err(capture_error)?;

        serde_json::to_value(state.to_payload()).map_err(|e| CommandError::Failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MessageBridge;
    use crate::sampler::tests::ScriptedSource;
    use crate::sampler::SamplerSettings;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(command: &str) -> CommandContext {
        CommandContext {
            request_id: "r1".into(),
            command: command.into(),
            cancel: CancellationToken::new(),
        }
    }

    fn sampler(source: ScriptedSource) -> StateSampler {
        StateSampler::new(
            Arc::new(source),
            SamplerSettings::default(),
            MessageBridge::offline(4),
        )
    }

    #[tokio::test]
    async fn screenshot_uses_requested_bounds() {
        let cmd = ScreenshotCommand::new(sampler(ScriptedSource::new(&["Editor"])));
        let out = cmd
            .call(ctx("screenshot"), json!({"max_width": 320, "max_height": 200}))
            .await
            .unwrap();
        assert_eq!(out["width"], 320);
        assert_eq!(out["height"], 200);
        assert_eq!(out["format"], "png");
        assert!(out["screenshot_base64"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn screenshot_permission_error_maps_to_not_allowed() {
        let mut source = ScriptedSource::new(&["Editor"]);
        source.fail_screen = true;
        let cmd = ScreenshotCommand::new(sampler(source));
        let err = cmd.call(ctx("screenshot"), json!(null)).await.unwrap_err();
        assert!(matches!(err, CommandError::NotAllowed(_)));
    }

    #[tokio::test]
    async fn screenshot_rejects_bad_params() {
        let cmd = ScreenshotCommand::new(sampler(ScriptedSource::new(&["Editor"])));
        let err = cmd
            .call(ctx("screenshot"), json!({"max_width": "wide"}))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn capture_state_returns_wire_payload() {
        let cmd = CaptureStateCommand::new(sampler(ScriptedSource::new(&["Terminal"])));
        let out = cmd.call(ctx("capture_state"), json!({})).await.unwrap();
        assert_eq!(out["active_window_title"], "Terminal");
        assert!(out["timestamp"].is_string());
    }
}
