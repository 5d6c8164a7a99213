//! Synthesized mouse and keyboard input.
//!
//! The executor speaks in [`InputEvent`]s; an [`InputDriver`] turns them
//! into real input. [`DryRunDriver`] only records and logs them.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::geometry::Point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    Left,
    Right,
}

/// Keys reachable through typed-text escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialKey {
    Enter,
    Tab,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InputEvent {
    MoveTo { point: Point },
    Click { button: MouseButton },
    DoubleClick { button: MouseButton },
    Text { text: String },
    Key { key: SpecialKey },
}

/// Split typed text into text runs and special keys.
///
/// Escapes:
/// - `\n` -> Enter
/// - `\t` -> Tab
/// - `\\` -> backslash
///
/// Any other backslash is typed literally.
pub fn parse_typed_text(text: &str) -> Vec<InputEvent> {
    let mut events = Vec::new();
    let mut run = String::new();
    let mut chars = text.chars().peekable();

    let flush = |run: &mut String, events: &mut Vec<InputEvent>| {
        if !run.is_empty() {
            events.push(InputEvent::Text {
                text: std::mem::take(run),
            });
        }
    };

    while let Some(c) = chars.next() {
        if c != '\\' {
            run.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                flush(&mut run, &mut events);
                events.push(InputEvent::Key {
                    key: SpecialKey::Enter,
                });
            }
            Some('t') => {
                chars.next();
                flush(&mut run, &mut events);
                events.push(InputEvent::Key {
                    key: SpecialKey::Tab,
                });
            }
            Some('\\') => {
                chars.next();
                run.push('\\');
            }
            _ => run.push('\\'),
        }
    }
    flush(&mut run, &mut events);
    events
}

/// Performs input events. Implementations block until the event is sent.
pub trait InputDriver: Send + Sync {
    fn send(&self, event: &InputEvent) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Records events instead of performing them.
#[derive(Debug, Default)]
pub struct DryRunDriver {
    events: Mutex<Vec<InputEvent>>,
}

impl DryRunDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far, oldest first.
    pub fn events(&self) -> Vec<InputEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn take(&self) -> Vec<InputEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl InputDriver for DryRunDriver {
    fn send(&self, event: &InputEvent) -> Result<()> {
        info!(?event, "dry run: input not sent");
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

#[cfg(feature = "input")]
pub use live::EnigoDriver;

#[cfg(feature = "input")]
mod live {
    use std::sync::{Mutex, PoisonError};

    use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
    use tracing::debug;

    use super::{InputDriver, InputEvent, MouseButton, SpecialKey};
    use crate::error::{EngineError, Result};

    /// Real input through the platform's input APIs.
    pub struct EnigoDriver {
        enigo: Mutex<Enigo>,
    }

    impl std::fmt::Debug for EnigoDriver {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("EnigoDriver").finish_non_exhaustive()
        }
    }

    impl EnigoDriver {
        pub fn new() -> Result<Self> {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|e| EngineError::Input(format!("cannot open input device: {}", e)))?;
            Ok(Self {
                enigo: Mutex::new(enigo),
            })
        }
    }

    fn button(button: MouseButton) -> Button {
        match button {
            MouseButton::Left => Button::Left,
            MouseButton::Right => Button::Right,
        }
    }

    impl InputDriver for EnigoDriver {
        fn send(&self, event: &InputEvent) -> Result<()> {
            let mut enigo = self.enigo.lock().unwrap_or_else(PoisonError::into_inner);
            debug!(?event, "sending input");
            let sent = match event {
                InputEvent::MoveTo { point } => enigo.move_mouse(point.x, point.y, Coordinate::Abs),
                InputEvent::Click { button: b } => enigo.button(button(*b), Direction::Click),
                InputEvent::DoubleClick { button: b } => enigo
                    .button(button(*b), Direction::Click)
                    .and_then(|_| enigo.button(button(*b), Direction::Click)),
                InputEvent::Text { text } => enigo.text(text),
                InputEvent::Key { key } => {
                    let key = match key {
                        SpecialKey::Enter => Key::Return,
                        SpecialKey::Tab => Key::Tab,
                    };
                    enigo.key(key, Direction::Click)
                }
            };
            sent.map_err(|e| EngineError::Input(e.to_string()))
        }

        fn name(&self) -> &'static str {
            "enigo"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> InputEvent {
        InputEvent::Text { text: s.into() }
    }

    #[test]
    fn plain_text_is_one_run() {
        assert_eq!(parse_typed_text("hello world"), vec![text("hello world")]);
        assert!(parse_typed_text("").is_empty());
    }

    #[test]
    fn escapes_become_keys() {
        assert_eq!(
            parse_typed_text(r"user\tpass\n"),
            vec![
                text("user"),
                InputEvent::Key {
                    key: SpecialKey::Tab
                },
                text("pass"),
                InputEvent::Key {
                    key: SpecialKey::Enter
                },
            ]
        );
    }

    #[test]
    fn backslashes() {
        assert_eq!(parse_typed_text(r"C:\\temp"), vec![text(r"C:\temp")]);
        // Unknown escapes and a trailing backslash stay literal
        assert_eq!(parse_typed_text(r"a\qb\"), vec![text(r"a\qb\")]);
    }

    #[test]
    fn dry_run_records_in_order() {
        let driver = DryRunDriver::new();
        driver
            .send(&InputEvent::MoveTo {
                point: Point::new(3, 4),
            })
            .unwrap();
        driver
            .send(&InputEvent::Click {
                button: MouseButton::Left,
            })
            .unwrap();
        assert_eq!(driver.events().len(), 2);
        assert_eq!(driver.take().len(), 2);
        assert!(driver.events().is_empty());
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_value(InputEvent::Click {
            button: MouseButton::Right,
        })
        .unwrap();
        assert_eq!(json["event"], "click");
        assert_eq!(json["button"], "right");
    }
}
