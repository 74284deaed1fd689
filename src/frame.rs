//! Call-frame capture and classification.
//!
//! A [`FrameStack`] is captured once, when an event is observed, and never
//! changes afterwards. Frames are ordered outermost caller first, so the
//! entry point of a test or request comes before the code that touched the
//! database.

use std::fmt;

use backtrace::{resolve_frame, trace};

use crate::config::NPlusOneConfig;

/// Role of a frame's owning code relative to the monitored application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Code of the application being monitored.
    Application,
    /// Interception layer: decorators and other wrappers that forward calls.
    Proxy,
    /// Everything else (std, async runtimes, SeaORM, sqlx, ...).
    ThirdParty,
}

impl FrameKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Application => "APP",
            FrameKind::Proxy => "PROXY",
            FrameKind::ThirdParty => "THIRD PARTY",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One classified call frame.
///
/// `owner` is the Rust path of the enclosing type, or of the module for free
/// functions. `member` is the function or method name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallFrame {
    owner: String,
    member: String,
    kind: FrameKind,
}

impl CallFrame {
    pub fn new(owner: impl Into<String>, member: impl Into<String>, kind: FrameKind) -> Self {
        Self {
            owner: owner.into(),
            member: member.into(),
            kind,
        }
    }

    pub fn application(owner: impl Into<String>, member: impl Into<String>) -> Self {
        Self::new(owner, member, FrameKind::Application)
    }

    pub fn proxy(owner: impl Into<String>, member: impl Into<String>) -> Self {
        Self::new(owner, member, FrameKind::Proxy)
    }

    pub fn third_party(owner: impl Into<String>, member: impl Into<String>) -> Self {
        Self::new(owner, member, FrameKind::ThirdParty)
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_application(&self) -> bool {
        self.kind == FrameKind::Application
    }

    pub fn is_proxy(&self) -> bool {
        self.kind == FrameKind::Proxy
    }

    pub fn is_third_party(&self) -> bool {
        self.kind == FrameKind::ThirdParty
    }
}

impl fmt::Display for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner.is_empty() {
            write!(f, "{} [{}]", self.member, self.kind)
        } else {
            write!(f, "{}::{} [{}]", self.owner, self.member, self.kind)
        }
    }
}

/// Immutable, ordered sequence of call frames, outermost caller first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameStack {
    frames: Vec<CallFrame>,
}

impl FrameStack {
    pub fn new(frames: Vec<CallFrame>) -> Self {
        Self { frames }
    }

    pub fn frames(&self) -> &[CallFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CallFrame> {
        self.frames.iter()
    }

    /// Frames owned by the monitored application, in stack order.
    pub fn application_frames(&self) -> impl Iterator<Item = &CallFrame> {
        self.frames.iter().filter(|frame| frame.is_application())
    }
}

impl<'a> IntoIterator for &'a FrameStack {
    type Item = &'a CallFrame;
    type IntoIter = std::slice::Iter<'a, CallFrame>;

    fn into_iter(self) -> Self::IntoIter {
        self.frames.iter()
    }
}

impl fmt::Display for FrameStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.frames.is_empty() {
            return write!(f, "<empty stack>");
        }
        for (index, frame) in self.frames.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            write!(f, "  {index}: {frame}")?;
        }
        Ok(())
    }
}

// Owners whose frames sit on top of every capture and carry no information.
const CAPTURE_INTERNAL_OWNERS: &[&str] = &[
    "sea_orm_nplusone::frame::FrameExtractor",
    "sea_orm_nplusone::context::ContextTracker",
    "sea_orm_nplusone::tracker::Tracker",
];

const CAPTURE_INTERNAL_PREFIXES: &[&str] = &["backtrace::"];

/// Walks the current call stack and classifies each frame by path prefix.
#[derive(Debug, Clone)]
pub struct FrameExtractor {
    application_prefixes: Vec<String>,
    proxy_prefixes: Vec<String>,
    max_frames: usize,
}

impl FrameExtractor {
    /// Build an extractor from application and proxy path prefixes.
    ///
    /// Prefixes are matched on whole path segments: `my_app` matches
    /// `my_app::orders::load` but not `my_app_admin::load`.
    pub fn new<A, P>(application_prefixes: A, proxy_prefixes: P, max_frames: usize) -> Self
    where
        A: IntoIterator,
        A::Item: AsRef<str>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        Self {
            application_prefixes: normalize_prefixes(application_prefixes),
            proxy_prefixes: normalize_prefixes(proxy_prefixes),
            max_frames,
        }
    }

    pub fn from_config(config: &NPlusOneConfig) -> Self {
        Self::new(
            &config.application_prefixes,
            &config.proxy_prefixes,
            config.max_frames,
        )
    }

    /// Capture the current call stack.
    pub fn capture(&self) -> FrameStack {
        let mut symbols: Vec<String> = Vec::new();

        trace(|frame| {
            // Inlined calls resolve to several symbols for one physical frame.
            resolve_frame(frame, |symbol| {
                if let Some(name) = symbol.name() {
                    symbols.push(format!("{:#}", name));
                }
            });
            symbols.len() < self.max_frames
        });

        let mut frames: Vec<CallFrame> = symbols
            .iter()
            .map(|symbol| self.classify(symbol))
            .skip_while(is_capture_internal)
            .collect();
        frames.reverse();

        FrameStack::new(frames)
    }

    /// Classify a single demangled symbol name.
    pub fn classify(&self, symbol: &str) -> CallFrame {
        let (owner, member) = split_symbol(symbol);
        let kind = self.kind_of(&owner);
        CallFrame::new(owner, member, kind)
    }

    fn kind_of(&self, owner: &str) -> FrameKind {
        let path = format!("{owner}::");
        let matches = |prefixes: &[String]| {
            prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str()))
        };

        if matches(&self.proxy_prefixes) {
            FrameKind::Proxy
        } else if matches(&self.application_prefixes) {
            FrameKind::Application
        } else {
            FrameKind::ThirdParty
        }
    }
}

fn normalize_prefixes<I>(prefixes: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    prefixes
        .into_iter()
        .map(|prefix| prefix.as_ref().trim().trim_end_matches("::").to_string())
        .filter(|prefix| !prefix.is_empty())
        .map(|prefix| format!("{prefix}::"))
        .collect()
}

fn is_capture_internal(frame: &CallFrame) -> bool {
    let path = format!("{}::", frame.owner());
    CAPTURE_INTERNAL_OWNERS.contains(&frame.owner())
        || CAPTURE_INTERNAL_PREFIXES
            .iter()
            .any(|prefix| path.starts_with(prefix))
}

/// Split a demangled symbol into `(owner, member)`.
fn split_symbol(symbol: &str) -> (String, String) {
    let mut path = strip_hash(symbol.trim());

    // closures and async blocks report the enclosing function
    while let Some((head, last)) = path.rsplit_once("::") {
        if last.starts_with('{') {
            path = head;
        } else {
            break;
        }
    }

    if let Some(rest) = path.strip_prefix('<') {
        if let Some(close) = closing_bracket(rest) {
            let qualified = &rest[..close];
            let self_type = qualified.split(" as ").next().unwrap_or(qualified);
            let tail = rest[close + 1..].trim_start_matches("::");
            return match tail.rsplit_once("::") {
                Some((inner, member)) => (format!("{self_type}::{inner}"), member.to_string()),
                None => (self_type.to_string(), tail.to_string()),
            };
        }
    }

    match path.rsplit_once("::") {
        Some((owner, member)) => (owner.to_string(), member.to_string()),
        None => (String::new(), path.to_string()),
    }
}

fn strip_hash(path: &str) -> &str {
    match path.rsplit_once("::h") {
        Some((head, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            head
        }
        _ => path,
    }
}

// Index of the `>` closing a `<` that was already consumed.
fn closing_bracket(rest: &str) -> Option<usize> {
    let mut depth = 1usize;
    for (index, c) in rest.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}
