//! Operator-driven exploration: one state, one branch at every decision.

use std::fmt::Write as _;
use std::io::{BufRead, Write};

use colored::Colorize;

use super::policy::{ExplorationPolicy, StateOptions};
use crate::error::OperatorInputError;
use crate::ir::{ControlFlowGraph, EdgeType};
use crate::symbolic::SymbolicState;

// leading instructions shown for a branch destination
const BRANCH_PREVIEW_LEN: usize = 10;

/// Line-based operator I/O.
pub(crate) trait Prompt {
    /// `None` once the operator closes the input.
    fn read_line(&mut self, prompt: &str) -> Option<String>;
    fn show(&mut self, text: &str);
}

pub(crate) struct StdinPrompt;

impl Prompt for StdinPrompt {
    fn read_line(&mut self, prompt: &str) -> Option<String> {
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }

    fn show(&mut self, text: &str) {
        println!("{text}");
    }
}

/// Replays canned answers and records everything shown.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompt {
    answers: std::collections::VecDeque<String>,
    pub transcript: String,
}

#[cfg(test)]
impl ScriptedPrompt {
    pub(crate) fn new<I: IntoIterator<Item = S>, S: Into<String>>(answers: I) -> Self {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            transcript: String::new(),
        }
    }
}

#[cfg(test)]
impl Prompt for ScriptedPrompt {
    fn read_line(&mut self, prompt: &str) -> Option<String> {
        self.transcript.push_str(prompt);
        let answer = self.answers.pop_front()?;
        self.transcript.push_str(&answer);
        self.transcript.push('\n');
        Some(answer)
    }

    fn show(&mut self, text: &str) {
        self.transcript.push_str(text);
        self.transcript.push('\n');
    }
}

// Trailing `i`, glued or after a space, asks for details instead of committing.
fn split_info_suffix<'s>(body: &'s str, rest: &'s str) -> Result<(&'s str, bool), OperatorInputError> {
    match rest.trim_start() {
        "" => Ok((body, false)),
        "i" => Ok((body, true)),
        other => Err(OperatorInputError::BadSuffix(other.to_owned())),
    }
}

/// Parse a 1-based state index, returns the 0-based index and whether info was requested.
pub(crate) fn parse_state_choice(
    input: &str,
    count: usize,
) -> Result<(usize, bool), OperatorInputError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(OperatorInputError::Empty);
    }
    let digits = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if digits == 0 {
        return Err(OperatorInputError::NotAnIndex(input.to_owned()));
    }
    let (digits, info) = split_info_suffix(&input[..digits], &input[digits..])?;
    let index: usize = digits
        .parse()
        .map_err(|_| OperatorInputError::NotAnIndex(input.to_owned()))?;
    if index == 0 || index > count {
        return Err(OperatorInputError::IndexOutOfRange { index, count });
    }
    Ok((index - 1, info))
}

/// Parse one of the edge tokens `T`, `F`, `f`, `u`.
pub(crate) fn parse_edge_choice(
    input: &str,
    available: &[EdgeType],
) -> Result<(EdgeType, bool), OperatorInputError> {
    let input = input.trim();
    let Some(first) = input.chars().next() else {
        return Err(OperatorInputError::Empty);
    };
    let (token, info) = split_info_suffix(&input[..first.len_utf8()], &input[first.len_utf8()..])?;
    let edge = EdgeType::from_token(token)
        .ok_or_else(|| OperatorInputError::UnknownBranch(input.to_owned()))?;
    if !available.contains(&edge) {
        return Err(OperatorInputError::UnavailableBranch(first));
    }
    Ok((edge, info))
}

/// Stack, locals, globals, written memory and constraints of a state.
pub(crate) fn render_state(state: &SymbolicState, constraints: usize) -> String {
    let mut out = String::new();
    let pc = match &state.last_instruction {
        Some((offset, text)) => format!("{offset:#x} ({text})"),
        None => "-".into(),
    };
    let _ = writeln!(out, "{}: {pc}", "PC".bold());
    let _ = writeln!(out, "{}: {}", "Current Func".bold(), state.current_func);
    let stack: Vec<String> = state.stack.iter().map(|v| v.to_string()).collect();
    let _ = writeln!(out, "{}: [{}]", "Stack".bold(), stack.join(", "));
    let _ = writeln!(out, "{}:", "Local Var".bold());
    for (i, val) in state.locals.iter().enumerate() {
        let _ = match val {
            Some(val) => writeln!(out, "  {i}: {val}"),
            None => writeln!(out, "  {i}: <unset>"),
        };
    }
    let _ = writeln!(out, "{}:", "Global Var".bold());
    for (i, val) in state.globals.iter().enumerate() {
        if let Some(val) = val {
            let _ = writeln!(out, "  {i}: {val}");
        }
    }
    let _ = writeln!(out, "{}: {} pages", "Memory".bold(), state.memory.pages());
    for (addr, byte) in state.memory.written() {
        let _ = writeln!(out, "  {addr:#x}: {byte}");
    }
    let _ = writeln!(out, "{}:", "Constraints".bold());
    for constraint in state.constraints.iter().take(constraints) {
        let _ = writeln!(out, "  {constraint}");
    }
    out
}

/// What following `edge` adds to the path and where it leads.
pub(crate) fn render_branch(
    cfg: &ControlFlowGraph,
    dest: &str,
    state: &SymbolicState,
    shared_constraints: usize,
) -> String {
    let mut out = String::new();
    let added: Vec<String> = state.constraints[shared_constraints.min(state.constraints.len())..]
        .iter()
        .map(|c| c.to_string())
        .collect();
    let added = if added.is_empty() {
        "none".to_owned()
    } else {
        added.join(" && ")
    };
    let _ = writeln!(out, "{}: {added}", "Adds constraint".bold());
    let _ = writeln!(out, "{}: {dest}", "Destination".bold());
    let instructions = cfg.instructions_of(dest);
    if let Some(first) = instructions.first() {
        let _ = writeln!(out, "{}: {:#x}", "First instruction".bold(), first.offset);
    }
    for insn in instructions.iter().take(BRANCH_PREVIEW_LEN) {
        let _ = writeln!(out, "  {:#x}: {}", insn.offset, insn.text);
    }
    if instructions.len() > BRANCH_PREVIEW_LEN {
        let _ = writeln!(out, "  ...");
    }
    out
}

/// Delegates every decision to the operator.
pub(crate) struct Guided<P> {
    prompt: P,
}

impl<P: Prompt> Guided<P> {
    pub(crate) fn new(prompt: P) -> Self {
        Self { prompt }
    }

    #[cfg(test)]
    pub(crate) fn into_prompt(self) -> P {
        self.prompt
    }

    fn choose_state(&mut self, block: &str, options: &[StateOptions]) -> Option<usize> {
        let count = options.len();
        loop {
            let line = self.prompt.read_line(&format!(
                "{} live state(s) after {block}, pick one [1-{count}] (`{count} i` for info): ",
                count.to_string().cyan()
            ))?;
            match parse_state_choice(&line, count) {
                Ok((index, true)) => {
                    let option = &options[index];
                    if let Some((_, state)) = option.successors.first() {
                        let info = render_state(state, option.shared_constraints());
                        self.prompt.show(&info);
                    }
                }
                Ok((index, false)) => return Some(index),
                Err(err) => self.prompt.show(&err.to_string().red().to_string()),
            }
        }
    }

    fn choose_edge(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &str,
        option: &StateOptions,
    ) -> Option<usize> {
        let available: Vec<EdgeType> = option.successors.iter().map(|(edge, _)| *edge).collect();
        let tokens: Vec<String> = available
            .iter()
            .map(|edge| format!("{} ({edge})", edge.token()))
            .collect();
        loop {
            let line = self.prompt.read_line(&format!(
                "branches: {}, pick one (`T i` for info): ",
                tokens.join(", ")
            ))?;
            match parse_edge_choice(&line, &available) {
                Ok((edge, info)) => {
                    let index = available.iter().position(|e| *e == edge)?;
                    if !info {
                        return Some(index);
                    }
                    let dest = cfg.edges_of(block).get(edge).unwrap_or("<none>");
                    let (_, state) = &option.successors[index];
                    let info = render_branch(cfg, dest, state, option.shared_constraints());
                    self.prompt.show(&info);
                }
                Err(err) => self.prompt.show(&err.to_string().red().to_string()),
            }
        }
    }
}

impl<P: Prompt> ExplorationPolicy for Guided<P> {
    fn is_guided(&self) -> bool {
        true
    }

    fn select(
        &mut self,
        cfg: &ControlFlowGraph,
        block: &str,
        mut options: Vec<StateOptions>,
    ) -> Vec<(EdgeType, SymbolicState)> {
        options.retain(|option| !option.successors.is_empty());
        if options.is_empty() {
            return Vec::new();
        }
        let Some(state_index) = self.choose_state(block, &options) else {
            tracing::info!(block, "operator input closed");
            return Vec::new();
        };
        let option = options.swap_remove(state_index);
        let Some(edge_index) = self.choose_edge(cfg, block, &option) else {
            tracing::info!(block, "operator input closed");
            return Vec::new();
        };
        let mut successors = option.successors;
        vec![successors.swap_remove(edge_index)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_choice_parsing() {
        assert_eq!(parse_state_choice("2", 3), Ok((1, false)));
        assert_eq!(parse_state_choice(" 1i\n", 3), Ok((0, true)));
        assert_eq!(parse_state_choice("1 i", 3), Ok((0, true)));
        assert_eq!(parse_state_choice("3\ti\n", 3), Ok((2, true)));
        assert_eq!(parse_state_choice("", 3), Err(OperatorInputError::Empty));
        assert_eq!(
            parse_state_choice("x", 3),
            Err(OperatorInputError::NotAnIndex("x".into()))
        );
        assert_eq!(
            parse_state_choice("4", 3),
            Err(OperatorInputError::IndexOutOfRange { index: 4, count: 3 })
        );
        assert_eq!(
            parse_state_choice("0", 3),
            Err(OperatorInputError::IndexOutOfRange { index: 0, count: 3 })
        );
        assert_eq!(
            parse_state_choice("2x", 3),
            Err(OperatorInputError::BadSuffix("x".into()))
        );
    }

    #[test]
    fn edge_choice_parsing() {
        let available = [EdgeType::ConditionalTrue, EdgeType::ConditionalFalse];
        assert_eq!(
            parse_edge_choice("T", &available),
            Ok((EdgeType::ConditionalTrue, false))
        );
        assert_eq!(
            parse_edge_choice("Fi", &available),
            Ok((EdgeType::ConditionalFalse, true))
        );
        assert_eq!(
            parse_edge_choice("T i", &available),
            Ok((EdgeType::ConditionalTrue, true))
        );
        assert_eq!(
            parse_edge_choice("u", &available),
            Err(OperatorInputError::UnavailableBranch('u'))
        );
        assert_eq!(
            parse_edge_choice("x", &available),
            Err(OperatorInputError::UnknownBranch("x".into()))
        );
        assert_eq!(
            parse_edge_choice("Tz", &available),
            Err(OperatorInputError::BadSuffix("z".into()))
        );
        assert_eq!(
            parse_edge_choice("T  z", &available),
            Err(OperatorInputError::BadSuffix("z".into()))
        );
        assert_eq!(parse_edge_choice("  ", &available), Err(OperatorInputError::Empty));
    }

    #[test]
    fn scripted_prompt_runs_dry() {
        let mut prompt = ScriptedPrompt::new(["1"]);
        assert_eq!(prompt.read_line("> ").as_deref(), Some("1"));
        assert_eq!(prompt.read_line("> "), None);
        assert!(prompt.transcript.starts_with("> 1\n"));
    }
}
