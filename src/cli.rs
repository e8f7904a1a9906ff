//! Command-line interface and REPL
//!
//! Commands drive the camera and microphone managers against the simulated
//! hardware, e.g. `enable cam`, `select mic mic-builtin`, `unplug cam-usb`.

use anyhow::{anyhow, bail, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Which manager a command is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Camera,
    Microphone,
}

impl Target {
    fn parse(word: &str) -> Option<Self> {
        match word {
            "cam" | "camera" => Some(Target::Camera),
            "mic" | "microphone" => Some(Target::Microphone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Enable(Target),
    Disable { target: Target, force: bool },
    Toggle(Target),
    Resume(Target),
    /// `None` falls back to the default device
    Select { target: Target, device_id: Option<String> },
    Flip,
    Resolution { width: u32, height: u32 },
    AddFilter { target: Target, name: String },
    RemoveFilter { target: Target, name: String },
    Unplug(String),
    /// Re-plug a device as different hardware under the same id
    Replug(String),
    /// End the tracks of a device without unplugging it
    EndTrack(String),
    Status,
    Devices,
    Help,
    Quit,
}

pub const HELP: &str = "\
  enable <cam|mic>               acquire and publish
  disable <cam|mic> [force]      release (force stops tracks)
  toggle <cam|mic>
  resume <cam|mic>               re-enable if it was enabled before
  select <cam|mic> <id|none>     switch device
  flip                           switch front/back camera
  resolution <width>x<height>    camera target resolution
  filter add|remove <cam|mic> <name>
  unplug <device-id>             simulate hot-unplug
  replug <device-id>             simulate a device coming back
  end <device-id>                end the device's tracks
  status | devices | help | quit";

/// Parse one REPL line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&head, rest)) = words.split_first() else {
        return Ok(None);
    };

    let target = |index: usize| -> Result<Target> {
        let word = rest.get(index).ok_or_else(|| anyhow!("'{}' needs cam or mic", head))?;
        Target::parse(word).ok_or_else(|| anyhow!("Unknown target '{}' (expected cam or mic)", word))
    };
    let argument = |index: usize, what: &str| -> Result<String> {
        rest.get(index)
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("'{}' needs {}", head, what))
    };

    let command = match head {
        "enable" | "on" => Command::Enable(target(0)?),
        "disable" | "off" => Command::Disable {
            target: target(0)?,
            force: match rest.get(1) {
                None => false,
                Some(&"force") => true,
                Some(other) => bail!("Unexpected argument '{}'", other),
            },
        },
        "toggle" => Command::Toggle(target(0)?),
        "resume" => Command::Resume(target(0)?),
        "select" => {
            let target = target(0)?;
            let device_id = argument(1, "a device id or 'none'")?;
            Command::Select {
                target,
                device_id: (device_id != "none").then_some(device_id),
            }
        }
        "flip" => Command::Flip,
        "resolution" | "res" => {
            let value = argument(0, "<width>x<height>")?;
            let (width, height) = value
                .split_once('x')
                .and_then(|(w, h)| Some((w.parse().ok()?, h.parse().ok()?)))
                .ok_or_else(|| anyhow!("Invalid resolution '{}'", value))?;
            Command::Resolution { width, height }
        }
        "filter" => {
            let action = argument(0, "add or remove")?;
            let target = target(1)?;
            let name = argument(2, "a filter name")?;
            match action.as_str() {
                "add" => Command::AddFilter { target, name },
                "remove" | "rm" => Command::RemoveFilter { target, name },
                other => bail!("Unknown filter action '{}'", other),
            }
        }
        "unplug" => Command::Unplug(argument(0, "a device id")?),
        "replug" => Command::Replug(argument(0, "a device id")?),
        "end" => Command::EndTrack(argument(0, "a device id")?),
        "status" | "st" => Command::Status,
        "devices" | "ls" => Command::Devices,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("Unknown command '{}' (try 'help')", other),
    };
    Ok(Some(command))
}

/// Read lines on a blocking thread and forward parsed commands.
///
/// The task ends (after sending [`Command::Quit`]) on EOF, Ctrl-C or `quit`.
pub fn spawn_repl(tx: mpsc::Sender<Command>) -> JoinHandle<Result<()>> {
    tokio::task::spawn_blocking(move || {
        let mut rl = DefaultEditor::new()?;

        loop {
            let line = match rl.readline("capture> ") {
                Ok(line) => line,
                Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                    let _ = tx.blocking_send(Command::Quit);
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            let _ = rl.add_history_entry(line.as_str());

            match parse(&line) {
                Ok(Some(command)) => {
                    let quit = command == Command::Quit;
                    if tx.blocking_send(command).is_err() || quit {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => println!("{}", e),
            }
        }

        Ok(())
    })
}
