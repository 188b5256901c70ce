//! Terminal input parsing.
//!
//! A line starting with `/` is a command; anything else is chat.

use glam::Vec3;
use parade_net::{CameraPerspective, EntityAction, ParadeAction};

pub const HELP: &str = "\
commands:
  <text>                      send chat
  /view ground|aerial|grandstand|free
  /parade start|pause|stop|reset|next
  /create <id> <x> <y> <z>    place an entity
  /move <id> <x> <y> <z>      move an entity
  /scale <id> <factor>        scale an entity uniformly
  /delete <id>                remove an entity
  /select <id>                highlight an entity
  /entity <id>                show an entity
  /peers                      list linked peers
  /log                        show received chat
  /leave                      stop the session
  /quit                       exit";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Chat(String),
    View(CameraPerspective),
    Parade(ParadeAction),
    Entity {
        id: String,
        action: EntityAction,
        position: Option<Vec3>,
        scale: Option<f32>,
    },
    ShowEntity(String),
    Peers,
    Log,
    Leave,
    Quit,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("unknown command '/{0}', try /help")]
    UnknownCommand(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("'{0}' is not a number")]
    NotANumber(String),
}

fn number(word: &str) -> Result<f32, InputError> {
    word.parse()
        .map_err(|_| InputError::NotANumber(word.to_string()))
}

fn position(words: &[&str], usage: &'static str) -> Result<Vec3, InputError> {
    match words {
        [x, y, z] => Ok(Vec3::new(number(x)?, number(y)?, number(z)?)),
        _ => Err(InputError::Usage(usage)),
    }
}

fn perspective(word: &str) -> Option<CameraPerspective> {
    CameraPerspective::ALL
        .iter()
        .copied()
        .find(|p| p.name().eq_ignore_ascii_case(word))
}

fn parade_action(word: &str) -> Option<ParadeAction> {
    if word.eq_ignore_ascii_case("next") {
        return Some(ParadeAction::NextPhase);
    }
    ParadeAction::ALL
        .iter()
        .copied()
        .find(|a| a.name().eq_ignore_ascii_case(word))
}

/// Parse one line. `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<Input>, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(Input::Chat(line.to_string())));
    };

    let words: Vec<&str> = command.split_whitespace().collect();
    let (name, rest) = match words.split_first() {
        Some((name, rest)) => (*name, rest),
        None => return Err(InputError::Usage("/help")),
    };

    let entity = |action, position, scale| {
        rest.first().map(|id| Input::Entity {
            id: id.to_string(),
            action,
            position,
            scale,
        })
    };

    let input = match name {
        "view" => rest
            .first()
            .and_then(|w| perspective(w))
            .map(Input::View)
            .ok_or(InputError::Usage("/view ground|aerial|grandstand|free"))?,
        "parade" => rest
            .first()
            .and_then(|w| parade_action(w))
            .map(Input::Parade)
            .ok_or(InputError::Usage("/parade start|pause|stop|reset|next"))?,
        "create" | "move" => {
            let usage = "/create|/move <id> <x> <y> <z>";
            let pos = position(rest.get(1..).unwrap_or_default(), usage)?;
            let action = if name == "create" {
                EntityAction::Created
            } else {
                EntityAction::Moved
            };
            entity(action, Some(pos), None).ok_or(InputError::Usage(usage))?
        }
        "scale" => {
            let usage = "/scale <id> <factor>";
            let factor = match rest {
                [_, factor] => number(factor)?,
                _ => return Err(InputError::Usage(usage)),
            };
            entity(EntityAction::Scaled, None, Some(factor)).ok_or(InputError::Usage(usage))?
        }
        "delete" => entity(EntityAction::Deleted, None, None)
            .ok_or(InputError::Usage("/delete <id>"))?,
        "select" => entity(EntityAction::Selected, None, None)
            .ok_or(InputError::Usage("/select <id>"))?,
        "entity" => rest
            .first()
            .map(|id| Input::ShowEntity(id.to_string()))
            .ok_or(InputError::Usage("/entity <id>"))?,
        "peers" => Input::Peers,
        "log" => Input::Log,
        "leave" => Input::Leave,
        "quit" | "exit" => Input::Quit,
        "help" => Input::Help,
        other => return Err(InputError::UnknownCommand(other.to_string())),
    };
    Ok(Some(input))
}
