use std::collections::{HashMap, HashSet};

use crate::registry::Registry;

#[derive(Debug, Clone, Default)]
pub struct Args {
    pub flags: HashMap<String, bool>,
    pub params: HashMap<String, String>,
    pub commands: Vec<String>,
    pub positionals: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub args: Args,
    pub errors: Vec<ParseError>,
}

#[derive(Debug, Clone)]
pub struct ParseError {
    pub token: String,
    pub kind: ParseErrorKind,
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    UnknownToken,
    MissingParamValue { param: String },
}

impl ParseError {
    fn unknown(token: String, suggestions: Vec<String>) -> Self {
        Self {
            token,
            kind: ParseErrorKind::UnknownToken,
            suggestions,
        }
    }

    fn missing_param(param: String) -> Self {
        Self {
            token: param.clone(),
            kind: ParseErrorKind::MissingParamValue { param },
            suggestions: Vec::new(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ParseErrorKind::UnknownToken => {
                write!(f, "unknown argument '{}'", self.token)?;
                if !self.suggestions.is_empty() {
                    write!(f, " (did you mean {}?)", self.suggestions.join(", "))?;
                }
                Ok(())
            }
            ParseErrorKind::MissingParamValue { param } => {
                write!(f, "missing value for {}", param)
            }
        }
    }
}

impl Args {
    /// Split raw arguments into flags, params, commands and positionals.
    ///
    /// Flags are canonicalized to their primary name so callers only check
    /// one spelling. Params accept both `--port 80` and `--port=80`.
    pub fn collect(args: Vec<String>, registry: &Registry) -> ParseOutcome {
        let mut parsed = Args::default();
        let mut errors = Vec::new();
        let mut flag_tokens: HashMap<&str, &'static str> = HashMap::new();
        let mut param_tokens: HashSet<&str> = HashSet::new();
        let suggestion_tokens = registry.suggestion_tokens();

        for flag in registry.flags() {
            flag_tokens.insert(flag.name, flag.name);
            for alias in flag.aliases {
                flag_tokens.insert(alias, flag.name);
            }
        }
        for param in registry.params() {
            param_tokens.insert(param.name);
        }

        let mut has_command = false;
        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            let arg_str = arg.as_str();
            if let Some(name) = flag_tokens.get(arg_str) {
                parsed.flags.insert(name.to_string(), true);
                continue;
            }

            if let Some((name, value)) = arg_str.split_once('=') {
                if param_tokens.contains(name) {
                    parsed.params.insert(name.to_string(), value.to_string());
                    continue;
                }
            }

            if param_tokens.contains(arg_str) {
                match iter.next() {
                    Some(value) => {
                        parsed.params.insert(arg.clone(), value);
                    }
                    None => errors.push(ParseError::missing_param(arg.clone())),
                }
                continue;
            }

            if !has_command {
                if let Some(command) = registry.command_for(arg_str) {
                    parsed.commands.push(command.name.to_string());
                    has_command = true;
                    continue;
                }
            }

            if arg_str.starts_with('-') {
                let suggestions = suggest(arg_str, &suggestion_tokens);
                errors.push(ParseError::unknown(arg.clone(), suggestions));
                continue;
            }

            if has_command {
                parsed.positionals.push(arg);
                continue;
            }

            let suggestions = suggest(arg_str, &suggestion_tokens);
            errors.push(ParseError::unknown(arg.clone(), suggestions));
        }

        ParseOutcome {
            args: parsed,
            errors,
        }
    }
}

pub fn parse_env(registry: &Registry) -> ParseOutcome {
    let args: Vec<String> = std::env::args().skip(1).collect();
    Args::collect(args, registry)
}

fn suggest(token: &str, candidates: &[String]) -> Vec<String> {
    let threshold = match token.len() {
        0..=4 => 1,
        5..=7 => 2,
        _ => 3,
    };

    let mut scored: Vec<(usize, &String)> = candidates
        .iter()
        .map(|candidate| (levenshtein(token, candidate), candidate))
        .filter(|(distance, _)| *distance <= threshold)
        .collect();
    scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    scored.dedup_by(|a, b| a.1 == b.1);
    scored
        .into_iter()
        .take(3)
        .map(|(_, candidate)| candidate.clone())
        .collect()
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (curr[j] + 1).min(prev[j + 1] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b_chars.len()]
}
