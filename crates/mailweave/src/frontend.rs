//! Line-oriented front end.
//!
//! Commands are read from stdin on a plain thread and handed to the
//! control loop as [`Command`] events. Output is buffered and printed on
//! the render tick.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use mailweave_core::{
    Filters, Flow, Frontend, Mail, Mailbox, Orchestrator, Request, Response, StatusLevel,
    StatusLog, Target, Thread, ThreadNode,
};
use tokio::sync::mpsc;
use tracing::debug;

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Synchronize a mailbox.
    Sync {
        /// Account name.
        account: String,
        /// Mailbox name.
        mailbox: String,
    },
    /// Show the mailbox list.
    Mailboxes {
        /// Account name.
        account: String,
    },
    /// Show a conversation.
    Thread {
        /// Account name.
        account: String,
        /// Row id of the root mail.
        root_id: i64,
    },
    /// Download a message, print its cache path and the filter of the
    /// part it would be shown with.
    Open {
        /// Account name.
        account: String,
        /// Mailbox name.
        mailbox: String,
        /// Message UID.
        uid: u32,
    },
    /// Send a draft read from a file.
    Send {
        /// Account name.
        account: String,
        /// Draft file.
        path: PathBuf,
        /// File contents, loaded by the input thread.
        body: Vec<u8>,
    },
    /// List the commands.
    Help,
    /// Leave.
    Quit,
    /// A line that could not be understood.
    Invalid(String),
}

const HELP: &str = "commands: sync <account> <mailbox> | mailboxes <account> | \
thread <account> <root-id> | open <account> <mailbox> <uid> | send <account> <file> | quit";

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let command = match words.as_slice() {
        [] => return None,
        ["quit" | "q" | "exit"] => Command::Quit,
        ["help" | "?"] => Command::Help,
        ["sync", account, mailbox] => Command::Sync {
            account: (*account).to_string(),
            mailbox: (*mailbox).to_string(),
        },
        ["mailboxes", account] => Command::Mailboxes {
            account: (*account).to_string(),
        },
        ["thread", account, root_id] => match root_id.parse() {
            Ok(root_id) => Command::Thread {
                account: (*account).to_string(),
                root_id,
            },
            Err(_) => Command::Invalid(format!("bad root id `{root_id}`")),
        },
        ["open", account, mailbox, uid] => match uid.parse() {
            Ok(uid) => Command::Open {
                account: (*account).to_string(),
                mailbox: (*mailbox).to_string(),
                uid,
            },
            Err(_) => Command::Invalid(format!("bad uid `{uid}`")),
        },
        ["send", account, path] => Command::Send {
            account: (*account).to_string(),
            path: PathBuf::from(path),
            body: Vec::new(),
        },
        _ => Command::Invalid(format!("unknown command `{}`", line.trim())),
    };
    Some(command)
}

/// Reads commands from `input` until EOF or `quit`. Draft files named by
/// `send` are loaded here so the control loop never touches the disk.
pub fn read_commands(input: impl BufRead, commands: &mpsc::Sender<Command>) {
    for line in input.lines() {
        let Ok(line) = line else { break };
        let command = match parse_command(&line) {
            None => continue,
            Some(Command::Send { account, path, .. }) => match std::fs::read(&path) {
                Ok(body) => Command::Send { account, path, body },
                Err(e) => Command::Invalid(format!("cannot read {}: {e}", path.display())),
            },
            Some(command) => command,
        };

        let quit = command == Command::Quit;
        if commands.blocking_send(command).is_err() || quit {
            break;
        }
    }
    debug!("Input closed");
}

/// Names the part `open` shows and the filter it is piped through.
///
/// The first `text/plain` part is preferred, then the first part that is
/// not a multipart container.
fn describe_part(mail: &Mail, filters: &Filters) -> String {
    let Some(part) = mail
        .find_plaintext()
        .or_else(|| mail.find_first_non_multipart())
    else {
        return "no displayable part".to_string();
    };
    let content_type = part.content_type();
    match part.find_match(filters) {
        Some(command) => format!("part {} {content_type} through `{command}`", part.path),
        None => format!("part {} {content_type} has no filter", part.path),
    }
}

/// Flushes pending terminal output.
pub fn restore() {
    let _ = std::io::stdout().flush();
}

/// Front end printing to stdout.
#[derive(Debug)]
pub struct LineFrontend {
    status: StatusLog,
    filters: Filters,
    status_seen: usize,
    output: Vec<String>,
    done: bool,
}

impl LineFrontend {
    /// Creates a front end reporting messages from `status` and viewing
    /// body parts through `filters`.
    #[must_use]
    pub const fn new(status: StatusLog, filters: Filters) -> Self {
        Self {
            status,
            filters,
            status_seen: 0,
            output: Vec::new(),
            done: false,
        }
    }

    fn say(&mut self, line: impl Into<String>) {
        self.output.push(line.into());
    }

    fn report_error(&mut self, what: &str, response: &Response) -> bool {
        if let Response::Error(e) = response {
            self.status.error(format!("{what}: {e}"));
            true
        } else {
            false
        }
    }

    fn show_mailboxes(&mut self, account: &str, mailboxes: &[Mailbox]) {
        self.say(format!("{account}: {} mailbox(es)", mailboxes.len()));
        for mailbox in mailboxes {
            let indent = "  ".repeat(mailbox.depth as usize + 1);
            self.say(format!(
                "{indent}{} ({} unread / {}){}",
                mailbox.short_name,
                mailbox.unseen,
                mailbox.count,
                if mailbox.read_only { " read-only" } else { "" }
            ));
        }
    }

    fn show_threads(&mut self, account: &str, mailbox: &str, threads: &[Thread], cached: bool) {
        let origin = if cached { "cached" } else { "synced" };
        self.say(format!(
            "{account}/{mailbox}: {} thread(s), {origin}",
            threads.len()
        ));
        for thread in threads {
            self.say(format!(
                "{} {:>6} {} [{}] {}",
                if thread.unread { "*" } else { " " },
                thread.root_id,
                thread.last_date.format("%Y-%m-%d %H:%M"),
                thread.count,
                thread.subject
            ));
        }
    }

    fn show_thread(&mut self, nodes: &[ThreadNode]) {
        for node in nodes {
            let indent = "  ".repeat(node.depth as usize);
            self.say(format!(
                "{indent}{} {} {}",
                node.mail.uid,
                node.mail.date.format("%Y-%m-%d %H:%M"),
                node.mail.subject
            ));
        }
    }

    /// Connects `account`, then refreshes its mailboxes and INBOX.
    fn connect(orchestrator: &mut Orchestrator<Self>, account: String) {
        let owner = account.clone();
        let on_connected = move |orch: &mut Orchestrator<Self>, ui: &mut Self, response| {
            if ui.report_error(&format!("connecting {owner}"), &response) {
                return;
            }
            Self::refresh_mailboxes(orch, owner.clone());
            Self::sync(orch, owner, "INBOX".to_string());
        };
        orchestrator.dispatch(Target::Account, &account, Request::ConnectAccount, on_connected);
    }

    fn refresh_mailboxes(orchestrator: &mut Orchestrator<Self>, account: String) {
        let owner = account.clone();
        orchestrator.read_through(
            &account,
            Request::ListMailboxes,
            |_, _, _| {},
            move |_, ui, response| match response {
                Response::Mailboxes(mailboxes) => ui.show_mailboxes(&owner, &mailboxes),
                other => {
                    ui.report_error(&format!("listing mailboxes of {owner}"), &other);
                }
            },
        );
    }

    /// Reads the watermark from the store, then fetches new messages and
    /// reconciles flags.
    fn sync(orchestrator: &mut Orchestrator<Self>, account: String, mailbox: String) {
        let request = Request::FetchMailbox {
            mailbox: mailbox.clone(),
        };
        let owner = account.clone();
        orchestrator.dispatch(Target::Store, &owner, request, move |orch, ui, response| {
            let Response::Threads { last_seen_uid, .. } = response else {
                ui.report_error(&format!("loading {account}/{mailbox}"), &response);
                return;
            };
            Self::fetch_new(orch, account, mailbox, last_seen_uid);
        });
    }

    fn fetch_new(
        orchestrator: &mut Orchestrator<Self>,
        account: String,
        mailbox: String,
        last_seen_uid: u32,
    ) {
        let request = Request::FetchNewMessages {
            mailbox: mailbox.clone(),
            last_seen_uid,
        };
        let cache_owner = account.clone();
        orchestrator.read_through(
            &account.clone(),
            request,
            move |_, ui, response| {
                if let Response::Threads { mailbox, threads, .. } = &response
                    && !threads.is_empty()
                {
                    ui.show_threads(&cache_owner, mailbox, threads, true);
                }
            },
            move |orch, ui, response| {
                let Response::Threads { last_seen_uid, .. } = response else {
                    ui.report_error(&format!("fetching {account}/{mailbox}"), &response);
                    return;
                };
                Self::fetch_updates(orch, account, mailbox, last_seen_uid);
            },
        );
    }

    fn fetch_updates(
        orchestrator: &mut Orchestrator<Self>,
        account: String,
        mailbox: String,
        last_seen_uid: u32,
    ) {
        let request = Request::FetchMessageUpdates {
            mailbox,
            last_seen_uid,
        };
        let owner = account.clone();
        orchestrator.read_through(
            &account,
            request,
            |_, _, _| {},
            move |_, ui, response| match response {
                Response::Threads {
                    mailbox, threads, ..
                } => ui.show_threads(&owner, &mailbox, &threads, false),
                other => {
                    ui.report_error(&format!("updating {owner}"), &other);
                }
            },
        );
    }

    fn show_thread_of(orchestrator: &mut Orchestrator<Self>, account: &str, root_id: i64) {
        let request = Request::FetchThread { root_id };
        orchestrator.dispatch(Target::Store, account, request, |_, ui, response| {
            match response {
                Response::ThreadMails(nodes) if nodes.is_empty() => ui.say("no such thread"),
                Response::ThreadMails(nodes) => ui.show_thread(&nodes),
                other => {
                    ui.report_error("loading thread", &other);
                }
            }
        });
    }

    /// Looks up the stored structure of a message, then downloads it.
    fn open(orchestrator: &mut Orchestrator<Self>, account: String, mailbox: String, uid: u32) {
        let lookup = Request::FetchStoredMail {
            mailbox: mailbox.clone(),
            uid,
        };
        let owner = account.clone();
        orchestrator.dispatch(Target::Store, &owner, lookup, move |orch, ui, response| {
            let part = match response {
                Response::StoredMail(Some(mail)) => Some(describe_part(&mail, &ui.filters)),
                // Not synced yet, so the structure is unknown.
                Response::StoredMail(None) => None,
                other => {
                    ui.report_error("looking up message", &other);
                    return;
                }
            };
            let request = Request::FetchFullMail { mailbox, uid };
            orch.dispatch(Target::Account, &account, request, move |_, ui, response| {
                match response {
                    Response::FullMail { path } => {
                        ui.say(path.display().to_string());
                        if let Some(part) = part {
                            ui.say(part);
                        }
                    }
                    other => {
                        ui.report_error("opening message", &other);
                    }
                }
            });
        });
    }

    fn send(orchestrator: &mut Orchestrator<Self>, account: &str, path: &Path, body: Vec<u8>) {
        let name = path.display().to_string();
        let request = Request::SendMail { body };
        orchestrator.dispatch(Target::Account, account, request, move |_, ui, response| {
            if !ui.report_error(&format!("sending {name}"), &response) {
                ui.say(format!("sent {name}"));
            }
        });
    }
}

impl Frontend for LineFrontend {
    type Event = Command;

    fn start(&mut self, orchestrator: &mut Orchestrator<Self>) {
        self.say(HELP);
        let accounts: Vec<String> = orchestrator
            .accounts()
            .into_iter()
            .map(String::from)
            .collect();
        for account in accounts {
            Self::connect(orchestrator, account);
        }
    }

    fn handle_event(&mut self, orchestrator: &mut Orchestrator<Self>, event: Command) -> Flow {
        match event {
            Command::Quit => {
                self.done = true;
                return Flow::Quit;
            }
            Command::Help => self.say(HELP),
            Command::Invalid(reason) => self.say(reason),
            Command::Sync { account, mailbox } => Self::sync(orchestrator, account, mailbox),
            Command::Mailboxes { account } => Self::refresh_mailboxes(orchestrator, account),
            Command::Thread { account, root_id } => {
                Self::show_thread_of(orchestrator, &account, root_id);
            }
            Command::Open {
                account,
                mailbox,
                uid,
            } => Self::open(orchestrator, account, mailbox, uid),
            Command::Send {
                account,
                path,
                body,
            } => Self::send(orchestrator, &account, &path, body),
        }
        Flow::Continue
    }

    fn render(&mut self) {
        let messages = self.status.since(self.status_seen);
        if self.output.is_empty() && messages.is_empty() {
            return;
        }
        self.status_seen += messages.len();

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for line in self.output.drain(..) {
            let _ = writeln!(out, "{line}");
        }
        for message in messages {
            let prefix = match message.level {
                StatusLevel::Info => "--",
                StatusLevel::Error => "!!",
            };
            let _ = writeln!(out, "{prefix} {}", message.text);
        }
        let _ = out.flush();
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use mailweave_core::{BodyPart, BodyPath, FlagSet};

    use super::*;

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(parse_command("quit"), Some(Command::Quit));
        assert_eq!(
            parse_command("sync work INBOX"),
            Some(Command::Sync {
                account: "work".into(),
                mailbox: "INBOX".into()
            })
        );
        assert_eq!(
            parse_command("open work Lists/rust 42"),
            Some(Command::Open {
                account: "work".into(),
                mailbox: "Lists/rust".into(),
                uid: 42
            })
        );
        assert!(matches!(parse_command("thread work abc"), Some(Command::Invalid(_))));
        assert!(matches!(parse_command("frobnicate"), Some(Command::Invalid(_))));
    }

    #[tokio::test]
    async fn test_reader_loads_drafts() {
        let dir = tempfile::tempdir().unwrap();
        let draft = dir.path().join("draft.eml");
        std::fs::write(&draft, b"To: a@example.com\r\n\r\nhi").unwrap();
        let input = format!(
            "send work {}\nsend work {}\nquit\nsync work INBOX\n",
            draft.display(),
            dir.path().join("missing").display()
        );

        let (tx, mut rx) = mpsc::channel(8);
        tokio::task::spawn_blocking(move || read_commands(std::io::Cursor::new(input), &tx))
            .await
            .unwrap();

        let Some(Command::Send { body, .. }) = rx.recv().await else {
            panic!("expected send");
        };
        assert!(body.starts_with(b"To: a@example.com"));
        assert!(matches!(rx.recv().await, Some(Command::Invalid(_))));
        assert_eq!(rx.recv().await, Some(Command::Quit));
        // Reading stops at quit.
        assert_eq!(rx.recv().await, None);
    }

    fn part(path: Vec<usize>, mime_type: &str, mime_subtype: &str) -> BodyPart {
        BodyPart {
            path: BodyPath::from(path),
            mime_type: mime_type.into(),
            mime_subtype: mime_subtype.into(),
        }
    }

    fn mail(parts: Vec<BodyPart>) -> Mail {
        Mail {
            id: Some(1),
            uid: 7,
            message_id: "m@example.com".into(),
            in_reply_to: None,
            thread_id: Some(1),
            flags: FlagSet::new(),
            date: Utc::now(),
            subject: "hello".into(),
            parts,
            mailbox: "INBOX".into(),
        }
    }

    #[test]
    fn test_open_prefers_plaintext_filter() {
        let filters: Filters = [("text/*", "cat"), ("text/html", "w3m -T text/html")]
            .into_iter()
            .map(|(mime, command)| (mime.to_string(), command.to_string()))
            .collect();
        let alternative = mail(vec![
            part(vec![], "multipart", "alternative"),
            part(vec![0], "text", "html"),
            part(vec![1], "text", "plain"),
        ]);
        assert_eq!(describe_part(&alternative, &filters), "part /1 text/plain through `cat`");

        let html = mail(vec![
            part(vec![], "multipart", "mixed"),
            part(vec![0], "text", "html"),
            part(vec![1], "image", "png"),
        ]);
        assert_eq!(
            describe_part(&html, &filters),
            "part /0 text/html through `w3m -T text/html`"
        );

        let image = mail(vec![part(vec![], "image", "png")]);
        assert_eq!(describe_part(&image, &filters), "part / image/png has no filter");
        assert_eq!(describe_part(&mail(Vec::new()), &filters), "no displayable part");
    }

    #[test]
    fn test_errors_go_to_status() {
        let status = StatusLog::new();
        let mut ui = LineFrontend::new(status.clone(), Filters::new());
        assert!(ui.report_error("syncing", &Response::error("offline")));
        assert!(!ui.report_error("syncing", &Response::Done));
        assert_eq!(status.last().unwrap().text, "syncing: offline");
    }
}
