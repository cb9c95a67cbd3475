use std::collections::HashSet;
use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use crate::runtime::EventLoop;
use crate::session::{ChatSession, Role, Stage};

const HELP: &str = "\
commands:
  /cancel          interrupt the current answer
  /models          list local models
  /model [name]    show or switch the active model (pulls if missing)
  /pull <name>     download a model
  /pull-cancel     stop the current download
  /history         show previous questions
  /hide, /show     pause or resume output
  !!               ask the previous question again
  /quit            leave";

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

/// Interactive chat on stdin/stdout until `/quit`, EOF or a second Ctrl-C.
pub async fn run(mut event_loop: EventLoop) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut renderer = Renderer::default();
    println!("model: {}. /help for commands.", event_loop.model().model());
    renderer.prompt()?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if handle_line(&mut event_loop, &line) == Flow::Quit {
                    break;
                }
            }
            Some(event) = event_loop.next_event() => event_loop.apply(event),
            _ = tokio::signal::ctrl_c() => {
                if !event_loop.cancel() && !event_loop.cancel_pull() {
                    break;
                }
            }
        }
        renderer.render(event_loop.session())?;
    }

    event_loop.cancel();
    event_loop.cancel_pull();
    event_loop.shutdown().await;
    Ok(())
}

fn handle_line(event_loop: &mut EventLoop, line: &str) -> Flow {
    let line = line.trim();
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };
    match command {
        "" => {}
        "/quit" | "/exit" => return Flow::Quit,
        "/help" => println!("{HELP}"),
        "/cancel" => {
            if !event_loop.cancel() {
                println!("nothing to cancel");
            }
        }
        "/models" => event_loop.list_models(),
        "/model" if arg.is_empty() => println!("model: {}", event_loop.model().model()),
        "/model" => event_loop.switch_model(arg),
        "/pull" => event_loop.pull_model(arg),
        "/pull-cancel" => {
            if !event_loop.cancel_pull() {
                println!("no pull in progress");
            }
        }
        "/history" => {
            for (i, q) in event_loop.session().history.entries().iter().enumerate() {
                println!("{:>4}  {q}", i + 1);
            }
        }
        "/hide" => event_loop.session_mut().hide(),
        "/show" => event_loop.session_mut().show(),
        "!!" => {
            let session = event_loop.session_mut();
            let Some(previous) = session.history.previous().map(str::to_string) else {
                println!("no previous question");
                return Flow::Continue;
            };
            session.history.reset_cursor();
            println!("{previous}");
            ask(event_loop, &previous);
        }
        _ => ask(event_loop, line),
    }
    Flow::Continue
}

fn ask(event_loop: &mut EventLoop, question: &str) {
    if event_loop.session().is_busy() {
        println!("busy; /cancel to interrupt");
        return;
    }
    event_loop.submit(question);
}

/// Prints the parts of the session that have not been printed yet.
#[derive(Debug, Default)]
struct Renderer {
    printed: HashSet<Uuid>,
    streaming: Option<Streamed>,
    stage: Stage,
    pull_line: Option<String>,
    mid_line: bool,
}

#[derive(Debug)]
struct Streamed {
    id: Uuid,
    sql: usize,
    content: usize,
}

impl Renderer {
    fn prompt(&mut self) -> std::io::Result<()> {
        let mut out = std::io::stdout().lock();
        write!(out, "> ")?;
        out.flush()
    }

    fn line(&mut self, out: &mut impl Write, text: &str) -> std::io::Result<()> {
        if self.mid_line {
            writeln!(out)?;
            self.mid_line = false;
        }
        writeln!(out, "{text}")
    }

    fn render(&mut self, session: &ChatSession) -> std::io::Result<()> {
        if !session.visible {
            return Ok(());
        }
        let mut out = std::io::stdout().lock();

        let vanished = self
            .streaming
            .as_ref()
            .is_some_and(|s| !session.messages.iter().any(|m| m.id == s.id));
        if vanished {
            self.streaming = None;
            if self.mid_line {
                writeln!(out)?;
                self.mid_line = false;
            }
        }

        let last = session.messages.len().saturating_sub(1);
        for (i, msg) in session.messages.iter().enumerate() {
            if self.printed.contains(&msg.id) {
                continue;
            }
            match msg.role {
                Role::User => {}
                Role::Error => self.line(&mut out, &format!("error: {}", msg.content))?,
                Role::Notice => self.line(&mut out, &format!("-- {}", msg.content))?,
                Role::Assistant => {
                    let streaming = session.stage.is_active() && i == last;
                    self.stream(&mut out, msg.id, &msg.sql, &msg.content)?;
                    if streaming {
                        continue;
                    }
                    self.streaming = None;
                    if self.mid_line {
                        writeln!(out)?;
                        self.mid_line = false;
                    }
                }
            }
            self.printed.insert(msg.id);
        }

        let mut finished = false;
        if session.stage != self.stage {
            if matches!(session.stage, Stage::ExecutingQuery | Stage::StreamingSummary) {
                self.line(&mut out, &format!("[{}]", session.stage.label()))?;
            }
            finished = self.stage.is_active() && !session.stage.is_active();
            self.stage = session.stage;
        }

        let pull_line = session.pull.as_ref().map(|p| p.display_line());
        if pull_line != self.pull_line {
            if let Some(text) = &pull_line {
                self.line(&mut out, text)?;
            }
            self.pull_line = pull_line;
        }
        out.flush()?;
        drop(out);
        if finished { self.prompt() } else { Ok(()) }
    }

    /// Print whatever part of an assistant message is new since the last call.
    fn stream(&mut self, out: &mut impl Write, id: Uuid, sql: &str, content: &str) -> std::io::Result<()> {
        if self.streaming.as_ref().is_none_or(|s| s.id != id) {
            self.streaming = Some(Streamed { id, sql: 0, content: 0 });
        }
        let Some(state) = self.streaming.as_mut() else { return Ok(()) };
        if sql.len() > state.sql {
            if state.sql == 0 {
                write!(out, "sql> ")?;
            }
            write!(out, "{}", &sql[state.sql..])?;
            state.sql = sql.len();
            self.mid_line = true;
        }
        if content.len() > state.content {
            if state.content == 0 && state.sql > 0 {
                writeln!(out)?;
            }
            write!(out, "{}", &content[state.content..])?;
            state.content = content.len();
            self.mid_line = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChatMessage;

    #[test]
    fn streamed_text_is_printed_once() {
        let mut r = Renderer::default();
        let mut out = Vec::new();
        let id = Uuid::new_v4();
        r.stream(&mut out, id, "SELECT", "").unwrap();
        r.stream(&mut out, id, "SELECT 1", "").unwrap();
        r.stream(&mut out, id, "SELECT 1", "one").unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "sql> SELECT 1\none");
    }

    #[test]
    fn hidden_session_prints_nothing() {
        let mut r = Renderer::default();
        let mut s = ChatSession::new(Vec::new());
        s.push(ChatMessage::notice("hello"));
        s.hide();
        r.render(&s).unwrap();
        assert!(r.printed.is_empty());
        s.show();
        r.render(&s).unwrap();
        assert_eq!(r.printed.len(), 1);
    }
}
