use anyhow::Result;
use qanun::ai::{GeminiBackend, LLMBackend};
use qanun::chat::ChatController;
use qanun::config::Settings;
use qanun::render::RenderCache;
use qanun::render::Segment;
use qanun::render::html::source_label;
use qanun::session::{ChatSnapshot, SessionStore};
use qanun::storage::{FileStorage, Storage};
use qanun::types::{ChatSession, EXAMPLE_PROMPTS, Role};
use std::io::Write;
use std::sync::Arc;
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

fn load_dotenv() {
    // A missing .env is normal; the process environment still applies.
    if let Err(err) = dotenvy::dotenv()
        && !err.not_found()
    {
        eprintln!("failed to read .env: {}", err);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

enum Command {
    Send(String),
    New,
    List,
    Open(usize),
    Stop,
    Quit,
    Unknown(String),
}

impl Command {
    fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Self::Send(line.to_string()));
        };
        let mut words = rest.split_whitespace();
        Some(match (words.next(), words.next()) {
            (Some("new"), None) => Self::New,
            (Some("list"), None) => Self::List,
            (Some("open"), Some(n)) => match n.parse::<usize>() {
                Ok(n) if n > 0 => Self::Open(n - 1),
                _ => Self::Unknown(line.to_string()),
            },
            (Some("stop"), None) => Self::Stop,
            (Some("quit") | Some("exit"), None) => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        })
    }
}

/// Prints the active session's reply as it is flushed.
#[derive(Default)]
struct Printer {
    session_id: Option<String>,
    message_index: Option<usize>,
    printed: usize,
    was_loading: bool,
    cache: RenderCache,
}

impl Printer {
    fn show_session(&mut self, snapshot: &ChatSnapshot) {
        let Some(session) = snapshot.active_session() else {
            return;
        };
        println!("── {} ──", session.title);
        if session.messages.is_empty() {
            println!("جرّب أحد الأسئلة التالية:");
            for prompt in EXAMPLE_PROMPTS {
                println!("  • {}", prompt);
            }
        }
        for message in &session.messages {
            match message.role {
                Role::User => println!("> {}", message.text),
                Role::Model => println!("{}\n", message.text),
            }
        }
        self.session_id = Some(session.id.clone());
        self.message_index = session.messages.len().checked_sub(1);
        self.printed = session.messages.last().map_or(0, |m| m.text.chars().count());
        self.was_loading = snapshot.is_loading;
        self.cache.clear();
    }

    fn update(&mut self, snapshot: &ChatSnapshot) {
        let Some(session) = snapshot.active_session() else {
            return;
        };
        if self.session_id.as_deref() != Some(session.id.as_str()) {
            self.show_session(snapshot);
            return;
        }

        if let Some(index) = session.messages.len().checked_sub(1)
            && session.messages[index].is_model()
        {
            if self.message_index != Some(index) {
                self.message_index = Some(index);
                self.printed = 0;
            }
            let delta: String = session.messages[index].text.chars().skip(self.printed).collect();
            if !delta.is_empty() {
                self.printed += delta.chars().count();
                print!("{}", delta);
                let _ = std::io::stdout().flush();
            }
        }

        if self.was_loading && !snapshot.is_loading {
            println!("\n");
            self.print_grounding(session);
        }
        self.was_loading = snapshot.is_loading;
    }

    fn print_grounding(&mut self, session: &ChatSession) {
        let Some((index, message)) = session.messages.iter().enumerate().next_back() else {
            return;
        };
        if !message.is_model() || message.sources().is_empty() {
            return;
        }
        let blocks = self.cache.render(index, &message.text, message.citations());
        for segment in blocks.iter().flat_map(|block| block.segments()) {
            if let Segment::Cited { anchor, .. } = segment {
                println!("  {} «{}»", anchor.label(), segment.plain_text());
            }
        }
        println!("المصادر:");
        for (i, source) in message.sources().iter().enumerate() {
            println!("  [{}] {} <{}>", i + 1, source_label(source), source.uri);
        }
        println!();
    }
}

fn list_sessions(snapshot: &ChatSnapshot) {
    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
    for (i, session) in snapshot.sessions.iter().enumerate() {
        let created = OffsetDateTime::from_unix_timestamp_nanos(i128::from(session.created_at) * 1_000_000)
            .ok()
            .and_then(|at| at.to_offset(offset).format(format).ok())
            .unwrap_or_default();
        let marker = if snapshot.active_session_id.as_deref() == Some(session.id.as_str()) {
            '*'
        } else {
            ' '
        };
        println!("{} {:>2}. {}  ({})", marker, i + 1, session.title, created);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv();
    init_tracing();

    let settings = Settings::from_env()?;
    tracing::info!(model = %settings.model, data_dir = %settings.data_dir.display(), "starting qanun");

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(settings.data_dir.clone()));
    let store = Arc::new(SessionStore::load(storage));
    let backend: Arc<dyn LLMBackend> = Arc::new(GeminiBackend::new(&settings));
    let controller = ChatController::new(store, backend, settings.flush_interval);

    let mut printer = Printer::default();
    printer.show_session(&controller.snapshot());

    let mut updates = controller.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                printer.update(&snapshot);
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match Command::parse(&line) {
                    None => {}
                    Some(Command::Send(prompt)) => {
                        if let Err(err) = controller.send_message(&prompt, None) {
                            println!("! {}", err);
                        }
                    }
                    Some(Command::New) => {
                        controller.new_session();
                    }
                    Some(Command::List) => list_sessions(&controller.snapshot()),
                    Some(Command::Open(index)) => {
                        let snapshot = controller.snapshot();
                        match snapshot.sessions.get(index) {
                            Some(session) => {
                                controller.select_session(&session.id);
                            }
                            None => println!("! no session {}", index + 1),
                        }
                    }
                    Some(Command::Stop) => {
                        if !controller.stop_generation() {
                            println!("! nothing is being generated");
                        }
                    }
                    Some(Command::Quit) => break,
                    Some(Command::Unknown(command)) => {
                        println!("! unknown command {command}; try /new, /list, /open N, /stop, /quit");
                    }
                }
            }
        }
    }

    controller.stop_generation();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert!(Command::parse("   ").is_none());
        assert!(matches!(Command::parse("ما هي اللائحة؟"), Some(Command::Send(text)) if text == "ما هي اللائحة؟"));
        assert!(matches!(Command::parse("/open 2"), Some(Command::Open(1))));
        assert!(matches!(Command::parse("/open 0"), Some(Command::Unknown(_))));
        assert!(matches!(Command::parse("/quit"), Some(Command::Quit)));
        assert!(matches!(Command::parse("/stop now"), Some(Command::Unknown(_))));
    }
}
