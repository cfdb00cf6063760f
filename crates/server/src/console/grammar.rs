//! Command grammar trees.
//!
//! A command is a tree of literal and argument nodes. Each node carries the
//! privilege needed to use it and, when a command may end there, an
//! executor. Parsing walks the token stream against the tree depth first;
//! the first path (in declaration order) that consumes every token and ends
//! on an executable node wins. When nothing matches, the error names the
//! deepest node reached and what could have followed it.

use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Privilege levels, ordered from least to most capable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Privilege {
    /// Read-only inspection.
    Operator,
    /// Anything, including mutation of live state.
    Admin,
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Privilege::Operator => f.write_str("operator"),
            Privilege::Admin => f.write_str("admin"),
        }
    }
}

/// Value kinds an argument node accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// One token.
    Word,
    /// One token parsed as a signed integer.
    Integer,
    /// Everything from this token to the end of the line.
    Greedy,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArgValue {
    Text(String),
    Integer(i64),
}

/// Argument values collected while parsing, by argument name.
#[derive(Clone, Debug, Default)]
pub struct Arguments {
    values: HashMap<&'static str, ArgValue>,
}

impl Arguments {
    pub fn text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(ArgValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(ArgValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

/// Output of a successful command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// End the console session after printing.
    pub close: bool,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            close: false,
        }
    }

    pub fn close(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            close: true,
        }
    }
}

/// A command that parsed but failed while running.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct CommandError(pub String);

pub type CommandResult = Result<Reply, CommandError>;

pub type Executor<C> = Arc<dyn Fn(C, Arguments) -> BoxFuture<'static, CommandResult> + Send + Sync>;

#[derive(Clone, Debug)]
enum Matcher {
    Root,
    Literal {
        name: &'static str,
        aliases: &'static [&'static str],
    },
    Argument {
        name: &'static str,
        kind: ArgKind,
    },
}

enum Accept {
    /// Matched, consuming up to token index `next`.
    Yes { value: Option<ArgValue>, next: usize },
    /// An argument node rejected the token's value.
    Invalid(String),
    No,
}

/// One node of a command tree.
pub struct Node<C> {
    matcher: Matcher,
    requires: Privilege,
    description: Option<&'static str>,
    executor: Option<Executor<C>>,
    children: Vec<Node<C>>,
}

impl<C> Node<C> {
    fn with_matcher(matcher: Matcher) -> Self {
        Self {
            matcher,
            requires: Privilege::Operator,
            description: None,
            executor: None,
            children: Vec::new(),
        }
    }

    pub fn literal(name: &'static str) -> Self {
        Self::with_matcher(Matcher::Literal { name, aliases: &[] })
    }

    /// A literal also accepted under other spellings.
    pub fn literal_with_aliases(name: &'static str, aliases: &'static [&'static str]) -> Self {
        Self::with_matcher(Matcher::Literal { name, aliases })
    }

    pub fn argument(name: &'static str, kind: ArgKind) -> Self {
        Self::with_matcher(Matcher::Argument { name, kind })
    }

    /// Require at least `privilege` to use this node and its subtree.
    pub fn requires(mut self, privilege: Privilege) -> Self {
        self.requires = privilege;
        self
    }

    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = Some(description);
        self
    }

    /// Allow the command to end at this node.
    pub fn executes<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(C, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        self.executor = Some(Arc::new(move |ctx, args| Box::pin(f(ctx, args))));
        self
    }

    pub fn then(mut self, child: Node<C>) -> Self {
        self.children.push(child);
        self
    }

    /// How this node is written in usage strings.
    pub fn label(&self) -> String {
        match &self.matcher {
            Matcher::Root => String::new(),
            Matcher::Literal { name, .. } => (*name).to_string(),
            Matcher::Argument { name, kind } => match kind {
                ArgKind::Greedy => format!("<{name}...>"),
                _ => format!("<{name}>"),
            },
        }
    }

    fn accept(&self, tokens: &[Token], index: usize) -> Accept {
        let token = &tokens[index];
        match &self.matcher {
            Matcher::Root => Accept::No,
            Matcher::Literal { name, aliases } => {
                if token.text == *name || aliases.contains(&token.text.as_str()) {
                    Accept::Yes {
                        value: None,
                        next: index + 1,
                    }
                } else {
                    Accept::No
                }
            }
            Matcher::Argument { kind, name } => match kind {
                ArgKind::Word => Accept::Yes {
                    value: Some(ArgValue::Text(token.text.clone())),
                    next: index + 1,
                },
                ArgKind::Integer => match token.text.parse::<i64>() {
                    Ok(n) => Accept::Yes {
                        value: Some(ArgValue::Integer(n)),
                        next: index + 1,
                    },
                    Err(_) => Accept::Invalid(format!(
                        "expected an integer for <{name}>, got {:?}",
                        token.text
                    )),
                },
                ArgKind::Greedy => {
                    let words: Vec<&str> = tokens[index..].iter().map(|t| t.text.as_str()).collect();
                    Accept::Yes {
                        value: Some(ArgValue::Text(words.join(" "))),
                        next: tokens.len(),
                    }
                }
            },
        }
    }

    fn permitted_children(&self, privilege: Privilege) -> impl Iterator<Item = &Node<C>> {
        self.children.iter().filter(move |c| c.requires <= privilege)
    }
}

/// A whitespace-separated input token with its byte span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// Split a command line into tokens. Double quotes group words; inside
/// quotes `\"` and `\\` escape.
pub fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let mut text = String::new();
        let mut end = start;
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some((idx, c)) = chars.next() {
                end = idx + c.len_utf8();
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => {
                        if let Some((idx, escaped)) = chars.next() {
                            end = idx + escaped.len_utf8();
                            text.push(escaped);
                        }
                    }
                    other => text.push(other),
                }
            }
            if !closed {
                return Err(ParseError::new(
                    ParseErrorKind::Unexpected,
                    "unterminated quoted string".to_string(),
                    input,
                    input.len(),
                    Vec::new(),
                    Vec::new(),
                ));
            }
        } else {
            while let Some(&(idx, c)) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                end = idx + c.len_utf8();
                chars.next();
            }
        }
        tokens.push(Token { text, start, end });
    }
    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// The first token names no command.
    UnknownCommand,
    /// Input ended before reaching an executable node.
    Incomplete,
    /// A token matched nothing at its position.
    Unexpected,
    /// An argument token had the wrong shape.
    InvalidArgument,
    /// The matching node needs more privilege than the session has.
    PermissionDenied,
}

/// Why a line failed to parse, and where.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Byte offset into the input where parsing stopped.
    pub position: usize,
    /// Input up to the failure point, marked `<--[HERE]`.
    pub context: String,
    /// Labels of the deepest node reached, from the root.
    pub deepest: Vec<String>,
    /// Labels of what could have followed the deepest node.
    pub expected: Vec<String>,
}

impl ParseError {
    fn new(
        kind: ParseErrorKind,
        message: String,
        input: &str,
        position: usize,
        deepest: Vec<String>,
        expected: Vec<String>,
    ) -> Self {
        let position = position.min(input.len());
        Self {
            kind,
            message,
            position,
            context: format!("{}<--[HERE]", &input[..position]),
            deepest,
            expected,
        }
    }

    /// Multi-line form for console output.
    pub fn render(&self) -> String {
        let mut out = format!("{}\n  {}", self.message, self.context);
        if !self.deepest.is_empty() {
            out.push_str(&format!("\n  after: {}", self.deepest.join(" ")));
        }
        if !self.expected.is_empty() {
            out.push_str(&format!("\n  expected: {}", self.expected.join(", ")));
        }
        out
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

/// Failure of [`Dispatcher::execute`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// A successful parse, ready to run.
pub struct ParsedCommand<C> {
    /// Labels of the matched nodes, from the root.
    pub path: Vec<String>,
    pub arguments: Arguments,
    executor: Executor<C>,
}

impl<C> ParsedCommand<C> {
    pub async fn run(self, ctx: C) -> CommandResult {
        (self.executor)(ctx, self.arguments).await
    }
}

/// One line of usage output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Usage {
    pub syntax: String,
    pub description: Option<&'static str>,
}

struct Frame<'a, C> {
    node: &'a Node<C>,
    next: usize,
    path: Vec<&'a Node<C>>,
    arguments: Vec<(&'static str, ArgValue)>,
}

/// Where the walk got furthest, for error reporting.
struct Deepest<'a, C> {
    next: usize,
    path: Vec<&'a Node<C>>,
}

/// The root of a command grammar.
pub struct Dispatcher<C> {
    root: Node<C>,
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        Self {
            root: Node::with_matcher(Matcher::Root),
        }
    }

    /// Add a top-level command.
    pub fn register(&mut self, node: Node<C>) {
        self.root.children.push(node);
    }

    /// Parse `input` for a session holding `privilege`.
    pub fn parse(&self, input: &str, privilege: Privilege) -> Result<ParsedCommand<C>, ParseError> {
        let tokens = tokenize(input)?;

        let mut stack = vec![Frame {
            node: &self.root,
            next: 0,
            path: Vec::new(),
            arguments: Vec::new(),
        }];
        let mut deepest = Deepest {
            next: 0,
            path: Vec::new(),
        };
        let mut invalid: Option<(usize, String)> = None;
        let mut denied: Option<(usize, Vec<&Node<C>>)> = None;

        while let Some(frame) = stack.pop() {
            if frame.next > deepest.next
                || (frame.next == deepest.next && frame.path.len() > deepest.path.len())
            {
                deepest = Deepest {
                    next: frame.next,
                    path: frame.path.clone(),
                };
            }

            if frame.next == tokens.len() {
                if let Some(executor) = &frame.node.executor {
                    let mut arguments = Arguments::default();
                    arguments.values.extend(frame.arguments);
                    return Ok(ParsedCommand {
                        path: frame.path.iter().map(|n| n.label()).collect(),
                        arguments,
                        executor: executor.clone(),
                    });
                }
                continue;
            }

            let mut next_frames = Vec::new();
            for child in &frame.node.children {
                match child.accept(&tokens, frame.next) {
                    Accept::Yes { value, next } => {
                        let mut path = frame.path.clone();
                        path.push(child);
                        if child.requires > privilege {
                            if denied.as_ref().is_none_or(|(at, _)| next > *at) {
                                denied = Some((next, path));
                            }
                            continue;
                        }
                        let mut arguments = frame.arguments.clone();
                        if let (Some(value), Matcher::Argument { name, .. }) =
                            (value, &child.matcher)
                        {
                            arguments.push((name, value));
                        }
                        next_frames.push(Frame {
                            node: child,
                            next,
                            path,
                            arguments,
                        });
                    }
                    Accept::Invalid(reason) => {
                        if invalid.as_ref().is_none_or(|(at, _)| frame.next > *at) {
                            invalid = Some((frame.next, reason));
                        }
                    }
                    Accept::No => {}
                }
            }
            // Reversed so the first declared child is explored first.
            stack.extend(next_frames.into_iter().rev());
        }

        Err(self.failure(input, &tokens, privilege, deepest, invalid, denied))
    }

    fn failure(
        &self,
        input: &str,
        tokens: &[Token],
        privilege: Privilege,
        deepest: Deepest<'_, C>,
        invalid: Option<(usize, String)>,
        denied: Option<(usize, Vec<&Node<C>>)>,
    ) -> ParseError {
        let labels = |path: &[&Node<C>]| path.iter().map(|n| n.label()).collect::<Vec<_>>();
        let node = deepest.path.last().copied().unwrap_or(&self.root);
        let expected: Vec<String> = node
            .permitted_children(privilege)
            .map(|c| c.label())
            .collect();
        let end_of = |index: usize| tokens.get(index).map_or(input.len(), |t| t.end);

        if let Some((next, path)) = denied
            && next >= deepest.next
        {
            let name = labels(&path).join(" ");
            return ParseError::new(
                ParseErrorKind::PermissionDenied,
                format!("permission denied: '{name}' requires admin"),
                input,
                end_of(next.saturating_sub(1)),
                labels(&path),
                Vec::new(),
            );
        }

        if let Some((at, reason)) = invalid
            && at >= deepest.next
        {
            return ParseError::new(
                ParseErrorKind::InvalidArgument,
                reason,
                input,
                end_of(at),
                labels(&deepest.path),
                expected,
            );
        }

        if tokens.is_empty() {
            return ParseError::new(
                ParseErrorKind::Incomplete,
                "empty command".to_string(),
                input,
                0,
                Vec::new(),
                expected,
            );
        }

        if deepest.next == tokens.len() {
            return ParseError::new(
                ParseErrorKind::Incomplete,
                format!("incomplete command: {}", labels(&deepest.path).join(" ")),
                input,
                input.trim_end().len(),
                labels(&deepest.path),
                expected,
            );
        }

        let token = &tokens[deepest.next];
        if deepest.next == 0 {
            return ParseError::new(
                ParseErrorKind::UnknownCommand,
                format!("unknown command: {:?}", token.text),
                input,
                end_of(0),
                Vec::new(),
                expected,
            );
        }

        ParseError::new(
            ParseErrorKind::Unexpected,
            format!("unexpected argument: {:?}", token.text),
            input,
            token.end,
            labels(&deepest.path),
            expected,
        )
    }

    /// Parse and run `input`.
    pub async fn execute(
        &self,
        input: &str,
        ctx: C,
        privilege: Privilege,
    ) -> Result<Reply, DispatchError> {
        let parsed = self.parse(input, privilege)?;
        Ok(parsed.run(ctx).await?)
    }

    /// Every executable command the session may run.
    pub fn usages(&self, privilege: Privilege) -> Vec<Usage> {
        let mut out = Vec::new();
        collect_usages(&self.root, String::new(), privilege, &mut out);
        out
    }

    /// Usages below the deepest node reached by the literal and argument
    /// prefix `input`, as `help <command...>` shows them.
    pub fn usages_for(&self, input: &str, privilege: Privilege) -> Result<Vec<Usage>, ParseError> {
        let tokens = tokenize(input)?;
        let mut node = &self.root;
        let mut prefix = String::new();

        for (index, _) in tokens.iter().enumerate() {
            let next = node.permitted_children(privilege).find(|child| {
                matches!(child.accept(&tokens, index), Accept::Yes { next, .. } if next == index + 1)
            });
            match next {
                Some(child) => {
                    if !prefix.is_empty() {
                        prefix.push(' ');
                    }
                    prefix.push_str(&child.label());
                    node = child;
                }
                None if index == 0 => {
                    return Err(ParseError::new(
                        ParseErrorKind::UnknownCommand,
                        format!("unknown command: {:?}", tokens[0].text),
                        input,
                        tokens[0].end,
                        Vec::new(),
                        self.root
                            .permitted_children(privilege)
                            .map(|c| c.label())
                            .collect(),
                    ));
                }
                None => break,
            }
        }

        let mut out = Vec::new();
        collect_usages(node, prefix, privilege, &mut out);
        Ok(out)
    }
}

fn collect_usages<C>(node: &Node<C>, prefix: String, privilege: Privilege, out: &mut Vec<Usage>) {
    if node.executor.is_some() && !prefix.is_empty() {
        out.push(Usage {
            syntax: prefix.clone(),
            description: node.description,
        });
    }
    for child in node.permitted_children(privilege) {
        let syntax = if prefix.is_empty() {
            child.label()
        } else {
            format!("{prefix} {}", child.label())
        };
        collect_usages(child, syntax, privilege, out);
    }
}
