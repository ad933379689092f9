//! Interactive commands.

pub mod run;

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { nickname: String },
    Logout,
    UserList,
    Send { text: String },
    SendFile { local_id: String, remote_id: String, path: String },
    Confirm { path: String },
    Reject,
    Help { command: Option<String> },
    List { all: bool },
    Exit,
}

/// Command names with their usage tips, in listing order.
pub const COMMANDS: &[(&str, &str)] = &[
    ("login", "use like: login <nickname>"),
    ("logout", "use like: logout"),
    ("userlist", "use like: userlist"),
    ("send", "send a message to everyone, use like: send <text>"),
    ("sendfile", "use like: sendfile <localID> <remoteID> <path>"),
    ("confirm", "accept a pending file, use like: confirm <path>"),
    ("reject", "decline a pending file, use like: reject"),
    ("list", "list all commands, -all also shows their tips"),
    ("help", "show the tip of one command, use like: help <command>"),
    ("exit", "close the connection and quit"),
];

pub fn tip(command: &str) -> Option<&'static str> {
    COMMANDS
        .iter()
        .find(|(name, _)| *name == command)
        .map(|(_, tip)| *tip)
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Unknown(String),
    Usage(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "empty command"),
            ParseError::Unknown(c) => {
                write!(f, "command {c} not found, use [list] to see all commands")
            }
            ParseError::Usage(tip) => write!(f, "invalid params, {tip}"),
        }
    }
}

impl std::str::FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let usage = || ParseError::Usage(tip(name).unwrap_or_default());

        match name {
            "" => Err(ParseError::Empty),
            "login" if !rest.is_empty() => Ok(Command::Login { nickname: rest.to_string() }),
            "logout" => Ok(Command::Logout),
            "userlist" => Ok(Command::UserList),
            "send" if !rest.is_empty() => Ok(Command::Send { text: rest.to_string() }),
            "sendfile" => {
                let mut parts = rest.splitn(3, char::is_whitespace).map(str::trim);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(l), Some(r), Some(p)) if !l.is_empty() && !r.is_empty() && !p.is_empty() => {
                        Ok(Command::SendFile {
                            local_id: l.to_string(),
                            remote_id: r.to_string(),
                            path: p.to_string(),
                        })
                    }
                    _ => Err(usage()),
                }
            }
            "confirm" if !rest.is_empty() => Ok(Command::Confirm { path: rest.to_string() }),
            "reject" => Ok(Command::Reject),
            "help" => Ok(Command::Help {
                command: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "list" => Ok(Command::List { all: rest == "-all" }),
            "exit" => Ok(Command::Exit),
            "login" | "send" | "confirm" => Err(usage()),
            other => Err(ParseError::Unknown(other.to_string())),
        }
    }
}
