use crate::game::{ClientGameState, TableEvent};
use shared::{client_color, ClientId, ObjectId, ServerEntry};
use std::io::{self, Write};

/// Prints table activity as text lines
pub struct Renderer<W: Write> {
    out: W,
    colored: bool,
}

impl<W: Write> Renderer<W> {
    pub fn new(out: W, colored: bool) -> Self {
        Self { out, colored }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn name(&self, state: &ClientGameState, client: ClientId) -> String {
        let nick = state
            .nick_of(client)
            .map(str::to_string)
            .unwrap_or_else(|| format!("client {}", client));
        if self.colored {
            let (r, g, b) = client_color(client);
            format!("\x1b[38;2;{};{};{}m{}\x1b[0m", r, g, b, nick)
        } else {
            nick
        }
    }

    /// Text for one event, or None when there is nothing worth showing
    pub fn describe(&self, state: &ClientGameState, event: &TableEvent) -> Option<String> {
        let line = match event {
            TableEvent::Joined { client, objects } => format!(
                "Joined as {} (id {}), {} objects on the table",
                self.name(state, *client),
                client,
                objects
            ),
            TableEvent::NickTaken { nick } => format!("Nick {:?} is taken", nick),
            TableEvent::PeerJoined { client } => format!("{} joined", self.name(state, *client)),
            TableEvent::PeerLeft { client, nick } => format!(
                "{} left",
                nick.clone().unwrap_or_else(|| format!("client {}", client))
            ),
            TableEvent::Created { from, ids } => {
                format!("{} created {}", self.name(state, *from), id_list(ids))
            }
            TableEvent::Selected { from, ids } if ids.is_empty() => {
                format!("{} deselected", self.name(state, *from))
            }
            TableEvent::Selected { from, ids } => {
                format!("{} selected {}", self.name(state, *from), id_list(ids))
            }
            TableEvent::Removed { from, ids } => {
                format!("{} removed {}", self.name(state, *from), id_list(ids))
            }
            // Drags arrive continuously
            TableEvent::Moved { .. } => return None,
            TableEvent::Flipped { from, ids } => {
                format!("{} flipped {}", self.name(state, *from), id_list(ids))
            }
            TableEvent::Owned {
                from,
                owner: Some(_),
                ids,
            } => format!("{} took {}", self.name(state, *from), id_list(ids)),
            TableEvent::Owned { from, ids, .. } => {
                format!("{} released {}", self.name(state, *from), id_list(ids))
            }
            TableEvent::Shuffled { from, count } => {
                format!("{} shuffled {} objects", self.name(state, *from), count)
            }
            TableEvent::Rotated { from, steps, ids } => format!(
                "{} rotated {} by {} steps",
                self.name(state, *from),
                id_list(ids),
                steps
            ),
            TableEvent::Chat { from, text } => format!("<{}> {}", self.name(state, *from), text),
            TableEvent::Rolled {
                from,
                sides,
                results,
            } => {
                let sum: u32 = results.iter().map(|r| u32::from(*r)).sum();
                let faces: Vec<String> = results.iter().map(u8::to_string).collect();
                format!(
                    "{} rolled {}d{}: {} (total {})",
                    self.name(state, *from),
                    results.len(),
                    sides,
                    faces.join(" "),
                    sum
                )
            }
            TableEvent::Login { granted: true } => "Admin access granted".to_string(),
            TableEvent::Login { granted: false } => "Wrong admin password".to_string(),
            TableEvent::Kicked { from, target } if Some(*target) == state.me() => {
                format!("You were kicked by {}", self.name(state, *from))
            }
            TableEvent::Kicked { from, target } => format!(
                "{} kicked {}",
                self.name(state, *from),
                self.name(state, *target)
            ),
            TableEvent::ClassLoaded { class, objects } => {
                format!("Loaded {} ({} objects)", class, objects)
            }
            TableEvent::ClassUnavailable { class } => format!("Class {} is unavailable", class),
            TableEvent::Stream { .. } => return None,
            TableEvent::Directory { servers } => directory_lines(servers).join("\n"),
        };
        Some(line)
    }

    pub fn event(&mut self, state: &ClientGameState, event: &TableEvent) -> io::Result<()> {
        match self.describe(state, event) {
            Some(line) => self.line(&line),
            None => Ok(()),
        }
    }

    pub fn line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{}", line)?;
        self.out.flush()
    }

    /// Every object back to front
    pub fn table(&mut self, state: &ClientGameState) -> io::Result<()> {
        if state.table().is_empty() {
            return self.line("The table is empty");
        }
        for object in state.table().iter() {
            let mut line = format!(
                "#{:<5} {:<20} v{} at ({:.1}, {:.1}) rot {}",
                object.id(),
                object.class().to_string(),
                object.variant(),
                object.location().x,
                object.location().y,
                object.rotation()
            );
            if object.flipped() {
                line.push_str(" flipped");
            }
            if let Some(client) = object.selected_by() {
                line.push_str(&format!(" selected by {}", self.name(state, client)));
            }
            if let Some(client) = object.owned_by() {
                line.push_str(&format!(" owned by {}", self.name(state, client)));
            }
            self.line(&line)?;
        }
        Ok(())
    }

    /// Every client with its round trip
    pub fn roster(&mut self, state: &ClientGameState) -> io::Result<()> {
        let lines: Vec<String> = state
            .roster()
            .iter()
            .map(|(id, member)| {
                let marker = if Some(*id) == state.me() { " (you)" } else { "" };
                format!(
                    "{:>3} {}{} {} ms",
                    id,
                    self.name(state, *id),
                    marker,
                    member.rtt_ms
                )
            })
            .collect();
        for line in lines {
            self.line(&line)?;
        }
        Ok(())
    }
}

fn id_list(ids: &[ObjectId]) -> String {
    match ids {
        [id] => format!("#{}", id),
        _ => format!("{} objects", ids.len()),
    }
}

pub fn directory_lines(servers: &[ServerEntry]) -> Vec<String> {
    if servers.is_empty() {
        return vec!["No servers listed".to_string()];
    }
    servers
        .iter()
        .map(|server| {
            format!(
                "{:<24} {}:{} ({} players)",
                server.name, server.host, server.port, server.players
            )
        })
        .collect()
}
