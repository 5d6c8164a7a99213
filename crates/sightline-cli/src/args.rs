//! CLI argument parsing with clap derive macros.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use sightline_core::geometry::{Point, Rect};

const FRAME_HELP: &str = "Read frames from this PNG instead of capturing the screen";

/// Screen-scraping UI automation.
///
/// Finds UI elements by OCR and image templates, clicks and types into
/// them, and recovers from failures. Results are printed as JSON on
/// stdout; logs go to stderr.
#[derive(Debug, Parser)]
#[command(name = "sightline", version)]
pub struct Cli {
    /// Configuration file [default: $SIGHTLINE_CONFIG, then <config dir>/sightline/config.json]
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Record input events instead of sending them
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Capture the window whose title contains TITLE (needs the capture feature)
    #[arg(long, global = true, value_name = "TITLE")]
    pub window: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Locate an element and print the detection result
    #[command(after_help = "\
Examples:
  sightline detect --text OK --frame screen.png
  sightline detect --template save_button --threshold 0.8
  sightline detect --text Save --template save_icon --prefer hybrid
  sightline detect --text 're:Total: \\d+' --region 0,400,800,200")]
    Detect(DetectArgs),

    /// Perform one action with retries and recovery
    #[command(after_help = "\
Examples:
  sightline act click --text OK
  sightline act type --text 'User name' --input 'ada\\tsecret\\n'
  sightline act click --template submit --at 640,480   # coordinates as last resort
  sightline act read --region 10,10,300,40
  sightline act wait --text Done --timeout 30
  sightline --dry-run act double-click --text Report.pdf")]
    Act(ActArgs),

    /// Run a JSON-lines script, one response per line
    #[command(after_help = "\
Each line is a request; blank lines and lines starting with # are skipped:
  {\"id\":\"1\",\"command\":{\"action\":\"execute\",\"step\":{\"action_type\":\"click\",\"target_text\":\"OK\"}}}
  {\"id\":\"2\",\"command\":{\"action\":\"detect\",\"descriptor\":{\"name\":\"ok\",\"text_patterns\":[\"OK\"]}}}
  {\"id\":\"3\",\"command\":{\"action\":\"stats\"}}

Other commands: clear_cache, reset_stats, reload_config (optional \"path\").")]
    Run(RunArgs),

    /// Inspect or extend the template library
    Templates {
        #[command(subcommand)]
        command: TemplateCommands,
    },

    /// Load, validate and print the effective configuration
    CheckConfig,
}

#[derive(Debug, clap::Args)]
pub struct TargetArgs {
    /// Text to find; `re:` prefix for a regex (repeatable)
    #[arg(long = "text", value_name = "PATTERN")]
    pub text: Vec<String>,

    /// Template name from the library (repeatable)
    #[arg(long = "template", value_name = "NAME")]
    pub template: Vec<String>,

    /// Only search this frame-relative region
    #[arg(long, value_name = "X,Y,W,H", value_parser = parse_rect)]
    pub region: Option<Rect>,

    /// Minimum match confidence (0-1)
    #[arg(long, value_name = "CONF")]
    pub threshold: Option<f32>,
}

#[derive(Debug, clap::Args)]
pub struct DetectArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// Force a detection method
    #[arg(long, value_enum)]
    pub prefer: Option<Preference>,

    /// Match text case-sensitively
    #[arg(long)]
    pub case_sensitive: bool,

    #[arg(long, value_name = "PNG", help = FRAME_HELP)]
    pub frame: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Preference {
    Text,
    Template,
    Hybrid,
}

#[derive(Debug, clap::Args)]
pub struct ActArgs {
    /// What to do
    #[arg(value_enum)]
    pub action: ActionKind,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Literal screen coordinates, used when detection fails
    #[arg(long, value_name = "X,Y", value_parser = parse_point, allow_hyphen_values = true)]
    pub at: Option<Point>,

    /// Offset from the element's center
    #[arg(long, value_name = "DX,DY", value_parser = parse_point, allow_hyphen_values = true)]
    pub offset: Option<Point>,

    /// Text to type; \n is Enter, \t is Tab, \\ is a backslash
    #[arg(long, value_name = "TEXT")]
    pub input: Option<String>,

    /// Per-attempt timeout in seconds
    #[arg(long, value_name = "SECS", default_value_t = 10.0)]
    pub timeout: f64,

    /// Maximum attempts [default: automation.max_retries]
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Give up after this many seconds overall, retries included
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<f64>,

    /// Fail unless the screen changes after the action
    #[arg(long)]
    pub verify_change: bool,

    #[arg(long, value_name = "PNG", help = FRAME_HELP)]
    pub frame: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ActionKind {
    Click,
    DoubleClick,
    RightClick,
    Type,
    Read,
    Wait,
}

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Script file, one JSON request per line
    pub script: PathBuf,

    /// Stop at the first failed request
    #[arg(long)]
    pub stop_on_error: bool,

    #[arg(long, value_name = "PNG", help = FRAME_HELP)]
    pub frame: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum TemplateCommands {
    /// List templates with their usage statistics
    List,

    /// Save a frame region as a new template
    #[command(after_help = "\
Examples:
  sightline templates capture ok_button --region 412,300,80,28
  sightline templates capture logo --region 0,0,64,64 --frame screen.png")]
    Capture(CaptureArgs),
}

#[derive(Debug, clap::Args)]
pub struct CaptureArgs {
    /// Template name (file stem in the template directory)
    pub name: String,

    /// Frame-relative region to crop
    #[arg(long, value_name = "X,Y,W,H", value_parser = parse_rect)]
    pub region: Rect,

    /// Free-form description stored in the sidecar
    #[arg(long, default_value = "")]
    pub description: String,

    #[arg(long, value_name = "PNG", help = FRAME_HELP)]
    pub frame: Option<PathBuf>,
}

fn numbers<const N: usize>(s: &str) -> Result<[i64; N], String> {
    let parts: Vec<&str> = s.split(',').map(str::trim).collect();
    if parts.len() != N {
        return Err(format!("expected {} comma-separated numbers, got '{}'", N, s));
    }
    let mut out = [0i64; N];
    for (slot, part) in out.iter_mut().zip(&parts) {
        *slot = part
            .parse()
            .map_err(|_| format!("'{}' is not a whole number", part))?;
    }
    Ok(out)
}

fn parse_point(s: &str) -> Result<Point, String> {
    let [x, y] = numbers::<2>(s)?;
    let coord = |v: i64| i32::try_from(v).map_err(|_| format!("{} is out of range", v));
    Ok(Point::new(coord(x)?, coord(y)?))
}

fn parse_rect(s: &str) -> Result<Rect, String> {
    let [x, y, w, h] = numbers::<4>(s)?;
    let coord = |v: i64| i32::try_from(v).map_err(|_| format!("{} is out of range", v));
    let size = |v: i64| match u32::try_from(v) {
        Ok(0) | Err(_) => Err(format!("size must be positive, got {}", v)),
        Ok(v) => Ok(v),
    };
    Ok(Rect::new(coord(x)?, coord(y)?, size(w)?, size(h)?))
}
