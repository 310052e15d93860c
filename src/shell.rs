use rustyline::{Editor, Helper, Config, error::ReadlineError, Context};
use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use std::future::Future;

const COMMANDS: [&str; 5] = ["status", "endpoint", "register", "search", "exit"];




/*
    @@@
    @CmdCompleter;
    . Drops CmdCompleter into 'rl.set_helper(Some(...))' and get instant, prefix-based command completion.
    . Only the first word is completed; collection names and queries are free text.
*/
struct CmdCompleter {
    commands: Vec<String>,
}
impl Helper for CmdCompleter {}
impl Hinter for CmdCompleter {
    type Hint = String;
}
impl Highlighter for CmdCompleter {}
impl Validator for CmdCompleter {}
impl Completer for CmdCompleter {
    type Candidate = Pair;
    fn complete(&self, line: &str, _pos: usize, _ctx: &Context<'_>) -> Result<(usize, Vec<Pair>), ReadlineError> {
        if line.contains(' ') {
            return Ok((0, Vec::new()));
        }
        let mut matches = Vec::new();
        for cmd in &self.commands {
            if cmd.starts_with(line) {
                matches.push(Pair {
                    display: cmd.clone(),
                    replacement: cmd.clone(),
                });
            }
        }
        Ok((0, matches))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Empty,
    Status,
    Endpoint,
    Register(String),
    Search { collection: String, query: String },
    Exit,
    Unknown(String),
}

pub fn parse_command(line: &str) -> ShellCommand {
    let input = line.trim();
    let (head, rest) = match input.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (input, ""),
    };
    match (head, rest) {
        ("", _) => ShellCommand::Empty,
        ("status", "") => ShellCommand::Status,
        ("endpoint", "") => ShellCommand::Endpoint,
        ("exit", "") | ("quit", "") => ShellCommand::Exit,
        ("register", name) if !name.is_empty() && !name.contains(char::is_whitespace) => {
            ShellCommand::Register(name.to_string())
        }
        ("search", args) => match args.split_once(char::is_whitespace) {
            Some((collection, query)) if !query.trim().is_empty() => ShellCommand::Search {
                collection: collection.to_string(),
                query: query.trim().to_string(),
            },
            _ => ShellCommand::Unknown(input.to_string()),
        },
        _ => ShellCommand::Unknown(input.to_string()),
    }
}




/*
    @@@
    @run_shell();
    . Reads commands with history and tab-completion until `exit`, Ctrl-C or Ctrl-D.
    . status/endpoint/register/search are dispatched to the given closures and awaited in turn.
    . History is loaded from and saved to `history`.
*/
pub async fn run_shell<SFut, EFut, RFut, QFut, OnStatus, OnEndpoint, OnRegister, OnSearch>(
    history: &str,
    mut on_status: OnStatus,
    mut on_endpoint: OnEndpoint,
    mut on_register: OnRegister,
    mut on_search: OnSearch,
) -> rustyline::Result<()>
where
    OnStatus: FnMut() -> SFut + 'static,
    SFut: Future<Output = ()> + 'static,
    OnEndpoint: FnMut() -> EFut + 'static,
    EFut: Future<Output = ()> + 'static,
    OnRegister: FnMut(&str) -> RFut + 'static,
    RFut: Future<Output = ()> + 'static,
    OnSearch: FnMut(&str, &str) -> QFut + 'static,
    QFut: Future<Output = ()> + 'static,
{
    let config = Config::builder().build();
    let mut rl: Editor<CmdCompleter, DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(CmdCompleter {
        commands: COMMANDS.into_iter().map(String::from).collect(),
    }));
    let _ = rl.load_history(history);

    loop {
        let line = rl.readline("harness> ");
        match line {
            Ok(line) => {
                rl.add_history_entry(line.trim())?;
                match parse_command(&line) {
                    ShellCommand::Empty => {}
                    ShellCommand::Status => on_status().await,
                    ShellCommand::Endpoint => on_endpoint().await,
                    ShellCommand::Register(name) => on_register(&name).await,
                    ShellCommand::Search { collection, query } => on_search(&collection, &query).await,
                    ShellCommand::Exit => break,
                    ShellCommand::Unknown(other) => {
                        println!("Unknown command: {}", other);
                        println!("Commands: status | endpoint | register <collection> | search <collection> <query> | exit");
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {:?}", err);
                break;
            },
        }
    }

    rl.save_history(history)?;
    Ok(())
}
