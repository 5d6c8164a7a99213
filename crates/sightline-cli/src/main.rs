//! sightline CLI entry point.

mod args;
mod paths;
mod runner;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use sightline_core::action::{ActionType, AutomationAction};
use sightline_core::config::ConfigHandle;
use sightline_core::descriptor::{ElementDescriptor, MethodPreference};
use sightline_core::engine::Engine;
use sightline_core::frame::{FrameSource, ImageFileSource};
use sightline_core::input::{DryRunDriver, InputDriver};
use tracing::{error, info};

use crate::args::{
    ActArgs, ActionKind, Cli, Commands, DetectArgs, Preference, TargetArgs, TemplateCommands,
};
use crate::runner::ScriptRunner;

fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so stdout carries only JSON
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

/// Run the command. `Ok(false)` means it ran but the action or detection
/// failed.
fn run(cli: Cli) -> Result<bool> {
    let mut config = paths::load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::CheckConfig => {
            match config.path() {
                Some(path) => info!(path = %path.display(), "configuration is valid"),
                None => info!("no configuration file, showing defaults"),
            }
            print_json(config.config())?;
            return Ok(true);
        }
        Commands::Templates {
            command: TemplateCommands::List,
        } => {
            let library = sightline_core::template::library::TemplateLibrary::load(
                &config.config().template,
            )?;
            print_json(&library.list())?;
            return Ok(true);
        }
        _ => {}
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        match &cli.command {
            Commands::Detect(args) => {
                let engine = build_engine(&cli, &config, args.frame.as_deref())?;
                let result = engine.detect(descriptor(args)?).await;
                print_json(&result)?;
                Ok(result.success)
            }
            Commands::Act(args) => {
                let engine = build_engine(&cli, &config, args.frame.as_deref())?;
                let result = engine.execute_with_retry(action(args)?).await;
                print_json(&result)?;
                Ok(result.success)
            }
            Commands::Run(args) => {
                let engine = build_engine(&cli, &config, args.frame.as_deref())?;
                let file = tokio::fs::File::open(&args.script)
                    .await
                    .with_context(|| format!("Failed to open script {}", args.script.display()))?;
                let summary = ScriptRunner::new(&engine, &mut config, args.stop_on_error)
                    .run(tokio::io::BufReader::new(file), tokio::io::stdout())
                    .await?;
                Ok(summary.all_succeeded())
            }
            Commands::Templates {
                command: TemplateCommands::Capture(args),
            } => {
                let engine = build_engine(&cli, &config, args.frame.as_deref())?;
                let info = engine
                    .capture_template(&args.name, args.region, &args.description)
                    .await?;
                print_json(&info)?;
                Ok(true)
            }
            Commands::CheckConfig
            | Commands::Templates {
                command: TemplateCommands::List,
            } => Ok(true),
        }
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_engine(cli: &Cli, config: &ConfigHandle, frame: Option<&Path>) -> Result<Engine> {
    let frames = frame_source(frame, cli.window.as_deref())?;
    let input = input_driver(cli.dry_run)?;
    Ok(Engine::new(config.config().clone(), frames, input)?)
}

fn frame_source(frame: Option<&Path>, window: Option<&str>) -> Result<Arc<dyn FrameSource>> {
    if let Some(path) = frame {
        return Ok(Arc::new(ImageFileSource::new(path)));
    }
    live_capture(window)
}

#[cfg(feature = "capture")]
fn live_capture(window: Option<&str>) -> Result<Arc<dyn FrameSource>> {
    use sightline_core::frame::ScreenCapture;
    Ok(Arc::new(match window {
        Some(title) => ScreenCapture::window(title),
        None => ScreenCapture::primary_monitor(),
    }))
}

#[cfg(not(feature = "capture"))]
fn live_capture(_window: Option<&str>) -> Result<Arc<dyn FrameSource>> {
    anyhow::bail!("No frame source: pass --frame <png> or build with the `capture` feature")
}

fn input_driver(dry_run: bool) -> Result<Arc<dyn InputDriver>> {
    if dry_run {
        return Ok(Arc::new(DryRunDriver::new()));
    }
    live_input()
}

#[cfg(feature = "input")]
fn live_input() -> Result<Arc<dyn InputDriver>> {
    Ok(Arc::new(sightline_core::input::EnigoDriver::new()?))
}

#[cfg(not(feature = "input"))]
fn live_input() -> Result<Arc<dyn InputDriver>> {
    tracing::warn!("built without the `input` feature, input events are only recorded");
    Ok(Arc::new(DryRunDriver::new()))
}

fn element_name(target: &TargetArgs) -> String {
    target
        .text
        .first()
        .or(target.template.first())
        .cloned()
        .unwrap_or_else(|| "element".to_string())
}

/// Convert `detect` args to a descriptor.
fn descriptor(args: &DetectArgs) -> Result<ElementDescriptor> {
    let target = &args.target;
    if target.text.is_empty() && target.template.is_empty() {
        anyhow::bail!("Nothing to detect: pass --text and/or --template");
    }

    let mut descriptor =
        ElementDescriptor::new(element_name(target)).case_sensitive(args.case_sensitive);
    for pattern in &target.text {
        descriptor = descriptor.text(pattern);
    }
    for name in &target.template {
        descriptor = descriptor.template(name);
    }
    if let Some(region) = target.region {
        descriptor = descriptor.region(region);
    }
    if let Some(threshold) = target.threshold {
        descriptor = descriptor.threshold(threshold);
    }
    if let Some(preference) = args.prefer {
        descriptor = descriptor.prefer(match preference {
            Preference::Text => MethodPreference::Text,
            Preference::Template => MethodPreference::Template,
            Preference::Hybrid => MethodPreference::Hybrid,
        });
    }
    Ok(descriptor)
}

/// Convert `act` args to an action.
///
/// Only the first text pattern and template are used; actions target one
/// element.
fn action(args: &ActArgs) -> Result<AutomationAction> {
    let kind = match args.action {
        ActionKind::Click => ActionType::Click,
        ActionKind::DoubleClick => ActionType::DoubleClick,
        ActionKind::RightClick => ActionType::RightClick,
        ActionKind::Type => ActionType::Type,
        ActionKind::Read => ActionType::Read,
        ActionKind::Wait => ActionType::Wait,
    };
    if !(args.timeout.is_finite() && args.timeout > 0.0) {
        anyhow::bail!("--timeout must be a positive number of seconds");
    }

    let target = &args.target;
    let mut action =
        AutomationAction::new(kind).timeout(Duration::from_secs_f64(args.timeout));
    if let Some(text) = target.text.first() {
        action = action.text(text);
    }
    if let Some(name) = target.template.first() {
        action = action.template(name);
    }
    if let Some(point) = args.at {
        action = action.at(point);
    }
    if let Some(region) = target.region {
        action = action.within(region);
    }
    if let Some(offset) = args.offset {
        action = action.offset(offset);
    }
    if let Some(text) = &args.input {
        action = action.input(text);
    }
    if let Some(threshold) = target.threshold {
        action = action.threshold(threshold);
    }
    if let Some(retries) = args.retries {
        action = action.retries(retries);
    }
    if args.verify_change {
        action = action.verify_change();
    }
    action.deadline_secs = args.deadline;
    action.validate()?;
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sightline_core::descriptor::DetectionMethod;
    use sightline_core::geometry::Point;

    fn act(argv: &[&str]) -> Result<AutomationAction> {
        let cli = Cli::parse_from(std::iter::once("sightline").chain(argv.iter().copied()));
        match cli.command {
            Commands::Act(args) => action(&args),
            other => panic!("expected act, got {:?}", other),
        }
    }

    #[test]
    fn act_args_become_an_action() {
        let action = act(&[
            "act", "type", "--text", "Name", "--input", "ada", "--offset", "-5,0", "--timeout",
            "2.5",
        ])
        .unwrap();
        assert_eq!(action.action_type, ActionType::Type);
        assert_eq!(action.target_text.as_deref(), Some("Name"));
        assert_eq!(action.input_text.as_deref(), Some("ada"));
        assert_eq!(action.click_offset, Point::new(-5, 0));
        assert_eq!(action.timeout, Duration::from_millis(2500));
        assert!(action.targets(DetectionMethod::Text));
    }

    #[test]
    fn invalid_actions_are_rejected_before_running() {
        assert!(act(&["act", "click"]).is_err());
        assert!(act(&["act", "type", "--text", "Name"]).is_err());
        assert!(act(&["act", "wait", "--timeout", "0"]).is_err());
        assert!(act(&["act", "click", "--text", "OK", "--deadline=-1"]).is_err());
    }

    #[test]
    fn deadline_flag_is_relative_to_submission() {
        let action = act(&["act", "click", "--text", "OK", "--deadline", "30"]).unwrap();
        assert_eq!(action.deadline_secs, Some(30.0));
        assert!(action.deadline.is_none());
    }

    #[test]
    fn detect_args_become_a_descriptor() {
        let cli = Cli::parse_from([
            "sightline",
            "detect",
            "--text",
            "Save",
            "--template",
            "save_icon",
            "--prefer",
            "hybrid",
        ]);
        let Commands::Detect(args) = cli.command else {
            panic!("expected detect");
        };
        let descriptor = descriptor(&args).unwrap();
        assert_eq!(descriptor.name(), "Save");
        assert!(descriptor.is_hybrid());
        assert_eq!(descriptor.template_names(), ["save_icon"]);
    }

    #[test]
    fn detect_needs_a_target() {
        let cli = Cli::parse_from(["sightline", "detect", "--threshold", "0.5"]);
        let Commands::Detect(args) = cli.command else {
            panic!("expected detect");
        };
        assert!(descriptor(&args).is_err());
    }

    #[tokio::test]
    async fn detect_against_an_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("screen.png");
        image::RgbaImage::new(64, 48).save(&png).unwrap();

        let mut config = sightline_core::config::Config::default();
        config.template.template_directory = dir.path().join("templates");
        let engine = Engine::new(
            config,
            frame_source(Some(&png), None).unwrap(),
            input_driver(true).unwrap(),
        )
        .unwrap();

        // No such template: a detector error, not a crash
        let result = engine
            .detect(ElementDescriptor::new("x").template("missing"))
            .await;
        assert!(!result.success);
        assert_eq!(
            result.error_category,
            Some(sightline_core::error::ErrorCategory::TemplateDetectorError)
        );
    }
}
