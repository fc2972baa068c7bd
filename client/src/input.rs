//! Client input management: turns typed lines and script lines into commands

use shared::ObjectId;
use thiserror::Error;

/// Longest nested `/script` chain that will be followed
pub const MAX_SCRIPT_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Create {
        package: String,
        class: String,
        x: f32,
        y: f32,
        variant: u8,
    },
    Select(Vec<ObjectId>),
    /// Select whatever is frontmost at a point
    Grab { x: f32, y: f32 },
    Deselect,
    /// Drag the current selection by an offset
    Move { dx: f32, dy: f32 },
    /// An empty id list means the current selection, as for the commands below
    Flip(Vec<ObjectId>),
    Own(Vec<ObjectId>),
    Disown(Vec<ObjectId>),
    Rotate { steps: i8, ids: Vec<ObjectId> },
    Remove(Vec<ObjectId>),
    Shuffle,
    Roll { count: u8, sides: u8 },
    Login(String),
    Kick(String),
    Script(String),
    Table,
    Who,
    Quit,
    Chat(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("unknown command /{0}")]
    UnknownCommand(String),
    #[error("/{command} needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("/{command}: {value:?} is not a valid number")]
    InvalidNumber { command: &'static str, value: String },
    #[error("dice must look like 2d6, got {0:?}")]
    InvalidDice(String),
}

fn number<T: std::str::FromStr>(command: &'static str, value: &str) -> Result<T, ParseError> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        command,
        value: value.to_string(),
    })
}

fn required<'a>(
    command: &'static str,
    argument: &'static str,
    value: Option<&'a str>,
) -> Result<&'a str, ParseError> {
    value.ok_or(ParseError::MissingArgument { command, argument })
}

fn id_list<'a>(
    command: &'static str,
    args: impl Iterator<Item = &'a str>,
) -> Result<Vec<ObjectId>, ParseError> {
    args.map(|arg| number(command, arg)).collect()
}

fn dice(text: &str) -> Result<(u8, u8), ParseError> {
    let invalid = || ParseError::InvalidDice(text.to_string());
    let (count, sides) = text.split_once(['d', 'D']).ok_or_else(invalid)?;
    let count = count.parse().map_err(|_| invalid())?;
    let sides = sides.parse().map_err(|_| invalid())?;
    Ok((count, sides))
}

/// Parses one input line. Blank lines and `#` comments yield `None`.
///
/// Anything that does not start with `/` is chat.
pub fn parse_command(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Chat(line.to_string())));
    };

    let mut args = rest.split_whitespace();
    let name = args.next().unwrap_or_default();
    let command = match name {
        "create" => {
            let package = required("create", "a package", args.next())?.to_string();
            let class = required("create", "a class", args.next())?.to_string();
            let x = number("create", required("create", "an x coordinate", args.next())?)?;
            let y = number("create", required("create", "a y coordinate", args.next())?)?;
            let variant = match args.next() {
                Some(value) => number("create", value)?,
                None => 0,
            };
            Command::Create {
                package,
                class,
                x,
                y,
                variant,
            }
        }
        "select" => {
            let ids = id_list("select", args)?;
            if ids.is_empty() {
                return Err(ParseError::MissingArgument {
                    command: "select",
                    argument: "object ids",
                });
            }
            Command::Select(ids)
        }
        "grab" => Command::Grab {
            x: number("grab", required("grab", "an x coordinate", args.next())?)?,
            y: number("grab", required("grab", "a y coordinate", args.next())?)?,
        },
        "deselect" => Command::Deselect,
        "move" => Command::Move {
            dx: number("move", required("move", "an x offset", args.next())?)?,
            dy: number("move", required("move", "a y offset", args.next())?)?,
        },
        "flip" => Command::Flip(id_list("flip", args)?),
        "own" => Command::Own(id_list("own", args)?),
        "disown" => Command::Disown(id_list("disown", args)?),
        "rotate" => {
            let steps = number("rotate", required("rotate", "a step count", args.next())?)?;
            Command::Rotate {
                steps,
                ids: id_list("rotate", args)?,
            }
        }
        "remove" => Command::Remove(id_list("remove", args)?),
        "shuffle" => Command::Shuffle,
        "roll" => {
            let (count, sides) = dice(required("roll", "dice like 2d6", args.next())?)?;
            Command::Roll { count, sides }
        }
        "login" => Command::Login(required("login", "a password", args.next())?.to_string()),
        "kick" => Command::Kick(required("kick", "a nick", args.next())?.to_string()),
        "script" => Command::Script(required("script", "a file", args.next())?.to_string()),
        "table" => Command::Table,
        "who" => Command::Who,
        "quit" => Command::Quit,
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };
    Ok(Some(command))
}
