use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use log::{debug, info};

use crate::{
    config::CommandMatching,
    dispatcher::DispatchError,
    net::{Connection, Listener},
    relay::RelayController,
    types::RelayState,
};

const READ_CHUNK: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCommand {
    SwitchOff,
    SwitchOn,
    Query,
}

impl PortCommand {
    const TOKENS: [(&'static str, PortCommand); 3] = [
        ("DO0=0", PortCommand::SwitchOff),
        ("DO0=1", PortCommand::SwitchOn),
        ("DO0?", PortCommand::Query),
    ];

    pub fn token(self) -> &'static str {
        match self {
            Self::SwitchOff => "DO0=0",
            Self::SwitchOn => "DO0=1",
            Self::Query => "DO0?",
        }
    }

    pub fn execute(self, relay: &mut RelayController) -> String {
        match self {
            Self::SwitchOff => {
                relay.turn_off();
                "OK\n".to_string()
            }
            Self::SwitchOn => {
                relay.turn_on();
                "OK\n".to_string()
            }
            Self::Query => state_line(relay.current_state()),
        }
    }
}

pub fn state_line(state: RelayState) -> String {
    format!("DO0={}\n", state.as_digit())
}

// Tokens are tried in a fixed order, so under `Contains` a line such as
// `DO0=10` selects `DO0=1`.
pub fn parse_command(line: &str, matching: CommandMatching) -> Option<PortCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    PortCommand::TOKENS
        .iter()
        .find(|(token, _)| match matching {
            CommandMatching::Contains => line.contains(token),
            CommandMatching::Exact => line.trim() == *token,
        })
        .map(|(_, command)| *command)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Idle,
    Handled { command: PortCommand, reply: String },
    Ignored(String),
    Disconnected,
}

enum Framed {
    Line(Vec<u8>),
    Overflow,
    Pending,
}

struct CommandSession<C> {
    connection: C,
    partial: Vec<u8>,
    discarding: bool,
}

impl<C: Connection> CommandSession<C> {
    fn new(connection: C) -> Self {
        Self {
            connection,
            partial: Vec::new(),
            discarding: false,
        }
    }

    fn has_line(&self) -> bool {
        self.partial.contains(&b'\n')
    }

    // Appends whatever is already readable. Never waits for more.
    fn fill(&mut self, max_line_bytes: usize) -> std::io::Result<()> {
        let mut chunk = [0_u8; READ_CHUNK];
        while !self.has_line()
            && self.partial.len() <= max_line_bytes
            && self.connection.wait_readable(Duration::ZERO)?
        {
            match self.connection.read(&mut chunk) {
                Ok(0) => break,
                Ok(read) => self.partial.extend_from_slice(&chunk[..read]),
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    break
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn next_line(&mut self, max_line_bytes: usize) -> Framed {
        if self.discarding {
            match self.partial.iter().position(|&byte| byte == b'\n') {
                Some(end) => {
                    self.partial.drain(..=end);
                    self.discarding = false;
                }
                None => {
                    self.partial.clear();
                    return Framed::Pending;
                }
            }
        }

        match self.partial.iter().position(|&byte| byte == b'\n') {
            Some(end) if end > max_line_bytes => {
                self.partial.drain(..=end);
                Framed::Overflow
            }
            Some(end) => {
                let mut line: Vec<u8> = self.partial.drain(..=end).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Framed::Line(line)
            }
            None if self.partial.len() > max_line_bytes => {
                self.partial.clear();
                self.discarding = true;
                Framed::Overflow
            }
            None => Framed::Pending,
        }
    }
}

pub struct CommandServer<L: Listener> {
    listener: L,
    session: Option<CommandSession<L::Connection>>,
    matching: CommandMatching,
    max_line_bytes: usize,
}

impl<L: Listener> CommandServer<L> {
    pub fn new(listener: L, matching: CommandMatching, max_line_bytes: usize) -> Self {
        Self {
            listener,
            session: None,
            matching,
            max_line_bytes,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn poll(&mut self, relay: &mut RelayController) -> Result<CommandOutcome, DispatchError> {
        let mut dropped = false;
        if self
            .session
            .as_ref()
            .is_some_and(|session| !session.connection.is_open() && !session.has_line())
        {
            info!("command client disconnected");
            self.session = None;
            dropped = true;
        }

        if self.session.is_none() {
            if let Some(connection) = self.listener.poll_accept().map_err(DispatchError::Accept)? {
                info!("command client connected");
                self.session = Some(CommandSession::new(connection));
            }
        }

        let Some(session) = self.session.as_mut() else {
            return Ok(if dropped {
                CommandOutcome::Disconnected
            } else {
                CommandOutcome::Idle
            });
        };

        if let Err(err) = session.fill(self.max_line_bytes) {
            debug!("command session dropped: {err}");
            self.session = None;
            return Ok(CommandOutcome::Disconnected);
        }

        let raw = match session.next_line(self.max_line_bytes) {
            Framed::Line(raw) => raw,
            Framed::Overflow => {
                debug!("ignoring command line longer than {} bytes", self.max_line_bytes);
                return Ok(CommandOutcome::Ignored(String::new()));
            }
            Framed::Pending if session.connection.is_open() => return Ok(CommandOutcome::Idle),
            Framed::Pending => {
                info!("command client disconnected");
                self.session = None;
                return Ok(CommandOutcome::Disconnected);
            }
        };

        let Ok(line) = String::from_utf8(raw) else {
            debug!("ignoring command line with invalid utf-8");
            return Ok(CommandOutcome::Ignored(String::new()));
        };
        let Some(command) = parse_command(&line, self.matching) else {
            debug!("ignoring unrecognised command {line:?}");
            return Ok(CommandOutcome::Ignored(line));
        };

        let reply = command.execute(relay);
        info!("command {} -> {}", command.token(), reply.trim_end());
        let connection = &mut session.connection;
        connection
            .write_all(reply.as_bytes())
            .and_then(|()| connection.flush())
            .map_err(DispatchError::Reply)?;

        Ok(CommandOutcome::Handled { command, reply })
    }
}
