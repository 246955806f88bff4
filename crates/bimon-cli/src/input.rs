//! Manual input for a paused bisect session.

use bimon_core::Mark;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Mark the given commits, or the current one when empty.
    Mark(Mark, Vec<String>),
    Unmark(Vec<String>),
    /// Print the remaining range.
    List,
    Help,
    Quit,
}

pub const HELP: &str = "\
  good [commit...]    mark the current (or given) commits good
  bad [commit...]     mark them bad
  skip [commit...]    mark them untestable
  unmark [commit...]  remove any mark
  list                show the remaining candidates
  quit                close the session (it can be resumed)";

/// Parse one input line. Any unambiguous prefix of a keyword is accepted.
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Err("empty input".into());
    };
    let args: Vec<String> = words.map(str::to_string).collect();
    let word = word.to_ascii_lowercase();

    const KEYWORDS: [&str; 8] = ["good", "bad", "skip", "unmark", "list", "help", "quit", "exit"];
    let matches: Vec<&str> = KEYWORDS
        .iter()
        .copied()
        .filter(|k| k.starts_with(word.as_str()))
        .collect();
    let keyword = match matches.as_slice() {
        [only] => *only,
        [] => return Err(format!("unknown command: {word}")),
        many => return Err(format!("'{word}' is ambiguous: {}", many.join(", "))),
    };

    Ok(match keyword {
        "good" => Command::Mark(Mark::Good, args),
        "bad" => Command::Mark(Mark::Bad, args),
        "skip" => Command::Mark(Mark::Skip, args),
        "unmark" => Command::Unmark(args),
        "list" => Command::List,
        "help" => Command::Help,
        _ => Command::Quit,
    })
}
