//! Format-preserving org-mode engine.
//!
//! Parsing turns outline text into a [`core::Document`]; exporting turns the document back
//! into text. For every document in the supported subset `export(&parse(text)) == text`.
//! Modules are ordered leaf-first: the data model, the line classifier, the inline
//! tokenizer, timestamps, planning lines, drawers, the tree builder, the exporter and
//! the inherited-flag query.

pub use format::{export, export_checked};
pub use inline::tokenize;
pub use parser::{parse, parse_with_config};
pub use planning::parse_planning_items;
pub use query::{InheritedFlag, query_inherited_flag};

type PResult<'a, T> = nom::IResult<&'a str, T, nom::error::VerboseError<&'a str>>;

pub mod core {
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::{IndexMap, IndexSet};
    use serde::{Deserialize, Serialize};
    use std::fmt;

    /* ------------------------------- IDs ------------------------------- */

    /// Stable per-document heading identifier, assigned in document order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeadingId(pub usize);

    /// Position of a heading in a pre-order walk of the document.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeadingIndex(pub usize);

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one parsed org document.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Document {
        /// Top-level headings.
        #[serde(default)]
        pub headings: Vec<Heading>,

        /// Keyword sets in effect: the file-declared ones, or the configured default.
        #[serde(default)]
        pub todo_keyword_sets: Vec<TodoKeywordSet>,

        /// `#+KEY: value` lines found before the first heading, verbatim.
        #[serde(default)]
        pub file_config_lines: Vec<String>,

        /// Interpreted view of `file_config_lines`.
        #[serde(default)]
        pub settings: FileSettings,

        /// Raw text preceding the first heading, verbatim.
        #[serde(default)]
        pub lines_before_headings: String,

        /// False when the last line of the source had no terminator.
        pub final_newline: bool,

        /// Non-fatal degradations noticed while parsing.
        #[serde(default)]
        pub warnings: Vec<ParseWarning>,

        #[serde(skip)]
        outline: Vec<OutlineEntry>,
    }

    /// One row of the flat pre-order outline table.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct OutlineEntry {
        pub id: HeadingId,
        pub level: usize,
        /// Child positions from the document root down to this heading.
        pub path: Vec<usize>,
        pub parent: Option<HeadingIndex>,
    }

    impl Document {
        /// Rebuilds the outline table. Call after changing `headings` by hand.
        pub fn reindex(&mut self) {
            fn walk(
                headings: &[Heading],
                parent: Option<HeadingIndex>,
                prefix: &mut Vec<usize>,
                out: &mut Vec<OutlineEntry>,
            ) {
                for (pos, heading) in headings.iter().enumerate() {
                    prefix.push(pos);
                    let index = HeadingIndex(out.len());
                    out.push(OutlineEntry {
                        id: heading.id,
                        level: heading.level,
                        path: prefix.clone(),
                        parent,
                    });
                    walk(&heading.children, Some(index), prefix, out);
                    prefix.pop();
                }
            }

            let mut outline = Vec::new();
            walk(&self.headings, None, &mut Vec::new(), &mut outline);
            self.outline = outline;
        }

        pub fn outline(&self) -> &[OutlineEntry] {
            &self.outline
        }

        pub fn heading_count(&self) -> usize {
            self.outline.len()
        }

        /// Resolves a pre-order index to its heading.
        pub fn heading(&self, index: HeadingIndex) -> Option<&Heading> {
            let entry = self.outline.get(index.0)?;
            let (first, rest) = entry.path.split_first()?;
            let mut node = self.headings.get(*first)?;
            for pos in rest {
                node = node.children.get(*pos)?;
            }
            Some(node)
        }

        /// All headings in document order.
        pub fn headings(&self) -> impl Iterator<Item = (HeadingIndex, &Heading)> + '_ {
            (0..self.outline.len()).filter_map(move |i| {
                let index = HeadingIndex(i);
                self.heading(index).map(|h| (index, h))
            })
        }

        /// Ancestors of `index`, nearest first.
        pub fn ancestors(&self, index: HeadingIndex) -> Result<Vec<HeadingIndex>, QueryError> {
            let entry = self.outline.get(index.0).ok_or(QueryError::HeadingOutOfRange {
                index: index.0,
                count: self.outline.len(),
            })?;
            let mut out = Vec::new();
            let mut cursor = entry.parent;
            while let Some(parent) = cursor {
                out.push(parent);
                cursor = self.outline.get(parent.0).and_then(|e| e.parent);
            }
            Ok(out)
        }

        /// Looks a keyword up in the active keyword sets.
        pub fn keyword(&self, text: &str) -> Option<TodoKeyword> {
            lookup_keyword(&self.todo_keyword_sets, text)
        }
    }

    pub(crate) fn lookup_keyword(sets: &[TodoKeywordSet], text: &str) -> Option<TodoKeyword> {
        sets.iter().find_map(|set| {
            if set.active.iter().any(|k| k == text) {
                Some(TodoKeyword {
                    text: text.to_string(),
                    is_done: false,
                })
            } else if set.done.iter().any(|k| k == text) {
                Some(TodoKeyword {
                    text: text.to_string(),
                    is_done: true,
                })
            } else {
                None
            }
        })
    }

    /* ------------------------------ Entities ------------------------------ */

    /// A heading node with its drawers, description and children.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Heading {
        pub id: HeadingId,
        /// Number of leading stars.
        pub level: usize,

        /// Optional TODO keyword from one of the active keyword sets.
        pub keyword: Option<TodoKeyword>,

        /// Optional priority cookie like `[#A]`.
        pub priority: Option<Priority>,

        /// Title as inline rich text, without keyword, priority or tags.
        pub title: RichText,

        /// Tags after the headline (`:tag1:tag2:`), in source order.
        #[serde(default)]
        pub tags: IndexSet<String>,

        /// Whitespace between the title and the tag block.
        #[serde(default)]
        pub tag_gap: String,

        /// Whitespace that ended the headline.
        #[serde(default)]
        pub trailing_whitespace: String,

        /// Planning line (SCHEDULED, DEADLINE, CLOSED).
        pub planning: Option<Planning>,

        /// `:PROPERTIES:` drawer, when present.
        pub properties: Option<PropertyDrawer>,

        /// `:LOGBOOK:` drawer, when present.
        pub logbook: Option<Logbook>,

        /// Everything after the drawers up to the next heading.
        #[serde(default)]
        pub description: RichText,

        /// Child headings.
        #[serde(default)]
        pub children: Vec<Heading>,
    }

    impl Heading {
        pub fn new(id: HeadingId, level: usize, title: RichText) -> Self {
            Self {
                id,
                level,
                keyword: None,
                priority: None,
                title,
                tags: IndexSet::new(),
                tag_gap: String::new(),
                trailing_whitespace: String::new(),
                planning: None,
                properties: None,
                logbook: None,
                description: RichText::default(),
                children: vec![],
            }
        }

        /// Case-insensitive property lookup.
        pub fn property(&self, key: &str) -> Option<&str> {
            self.properties.as_ref()?.get(key)
        }
    }

    /* ----------------------------- File settings ----------------------------- */

    /// File-local settings read from `#+KEY: value` lines.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FileSettings {
        /// Recognized priorities (default `A`..`C`).
        pub priorities: PriorityRange,

        /// `#+STARTUP:` tokens in file order; later tokens override earlier ones.
        #[serde(default)]
        pub startup: Vec<String>,

        /// Any other per-file key/values, keys lowercased.
        #[serde(default)]
        pub meta: IndexMap<String, String>,
    }

    impl Default for FileSettings {
        fn default() -> Self {
            Self {
                priorities: PriorityRange::default(),
                startup: vec![],
                meta: IndexMap::new(),
            }
        }
    }

    /// Engine-level defaults that files may override.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ParseConfig {
        /// Keyword set used when the file declares none.
        pub default_keywords: TodoKeywordSet,
        pub priorities: PriorityRange,
    }

    impl Default for ParseConfig {
        fn default() -> Self {
            Self {
                default_keywords: TodoKeywordSet {
                    active: vec!["TODO".to_string()],
                    done: vec!["DONE".to_string()],
                },
                priorities: PriorityRange::default(),
            }
        }
    }

    /// One `#+TODO:` style declaration, split at `|`.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct TodoKeywordSet {
        pub active: Vec<String>,
        pub done: Vec<String>,
    }

    impl TodoKeywordSet {
        /// Parses `TODO(t) NEXT | DONE(d!)`; without `|` the last keyword is the done state.
        pub fn from_declaration(value: &str) -> Option<Self> {
            let words: Vec<&str> = value.split_whitespace().collect();
            if words.is_empty() {
                return None;
            }
            let strip = |w: &&str| -> String {
                match w.find('(') {
                    Some(pos) if w.ends_with(')') && pos > 0 => w[..pos].to_string(),
                    _ => w.to_string(),
                }
            };
            let set = match words.iter().position(|w| *w == "|") {
                Some(bar) => Self {
                    active: words[..bar].iter().map(strip).collect(),
                    done: words[bar + 1..].iter().map(strip).collect(),
                },
                None => {
                    let (last, rest) = words.split_last()?;
                    Self {
                        active: rest.iter().map(strip).collect(),
                        done: vec![strip(last)],
                    }
                }
            };
            Some(set)
        }

        pub fn contains(&self, keyword: &str) -> bool {
            self.active.iter().chain(self.done.iter()).any(|k| k == keyword)
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// Todo keyword with a "done" flag resolved against the active sets.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoKeyword {
        pub text: String,
        pub is_done: bool,
    }

    /// Single-letter priority, e.g. `[#A]`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub struct Priority(pub char);

    /// Highest, lowest and default priority letters (`#+PRIORITIES: A C B`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PriorityRange {
        pub highest: char,
        pub lowest: char,
        pub default: char,
    }

    impl Default for PriorityRange {
        fn default() -> Self {
            Self {
                highest: 'A',
                lowest: 'C',
                default: 'B',
            }
        }
    }

    impl PriorityRange {
        pub fn contains(&self, letter: char) -> bool {
            letter.is_ascii_uppercase() && (self.highest..=self.lowest).contains(&letter)
        }
    }

    /// Planning line attached to a heading.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Planning {
        /// Leading whitespace of the planning line.
        #[serde(default)]
        pub indent: String,
        /// Items in the order they were encountered.
        pub items: Vec<PlanningItem>,
    }

    impl Planning {
        pub fn get(&self, kind: PlanningKind) -> Option<&Timestamp> {
            self.items
                .iter()
                .find(|item| item.kind == kind)
                .map(|item| &item.timestamp)
        }

        pub fn scheduled(&self) -> Option<&Timestamp> {
            self.get(PlanningKind::Scheduled)
        }

        pub fn deadline(&self) -> Option<&Timestamp> {
            self.get(PlanningKind::Deadline)
        }

        pub fn closed(&self) -> Option<&Timestamp> {
            self.get(PlanningKind::Closed)
        }

        /// Items in emission order: SCHEDULED, DEADLINE, CLOSED.
        pub fn canonical_items(&self) -> Vec<&PlanningItem> {
            let mut items: Vec<&PlanningItem> = self.items.iter().collect();
            items.sort_by_key(|item| item.kind);
            items
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PlanningItem {
        pub kind: PlanningKind,
        pub timestamp: Timestamp,
    }

    /// Declaration order is the canonical emission order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    pub enum PlanningKind {
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKind {
        pub fn keyword(self) -> &'static str {
            match self {
                PlanningKind::Scheduled => "SCHEDULED",
                PlanningKind::Deadline => "DEADLINE",
                PlanningKind::Closed => "CLOSED",
            }
        }
    }

    /// A timestamp with optional time range, repeater and warning delay.
    ///
    /// Supports active `<...>` and inactive `[...]` timestamps. The weekday name is kept
    /// verbatim since files are written in many locales.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Timestamp {
        /// Whether the timestamp is "active" (`<...>`) or inactive (`[...]`).
        pub active: bool,
        pub date: NaiveDate,
        pub weekday: Option<String>,
        pub start: Option<NaiveTime>,
        /// End of a same-day time range (`10:00-11:30`).
        pub end: Option<NaiveTime>,
        /// Optional repeater cookie (`+1w`, `++1m`, `.+2d`).
        pub repeater: Option<Repeater>,
        /// Optional warning delay (`-2d`, `--1w`).
        pub delay: Option<Delay>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub value: u32,
        pub unit: TimeUnit,
    }

    /// `+` (cumulate), `++` (catch up), `.+` (restart from today).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum RepeaterKind {
        Cumulate,
        CatchUp,
        Restart,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Delay {
        pub kind: DelayKind,
        pub value: u32,
        pub unit: TimeUnit,
    }

    /// `-` warns before every occurrence, `--` only before the first one.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum DelayKind {
        All,
        First,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum TimeUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl TimeUnit {
        pub fn from_char(c: char) -> Option<Self> {
            match c {
                'h' => Some(TimeUnit::Hour),
                'd' => Some(TimeUnit::Day),
                'w' => Some(TimeUnit::Week),
                'm' => Some(TimeUnit::Month),
                'y' => Some(TimeUnit::Year),
                _ => None,
            }
        }

        pub fn as_char(self) -> char {
            match self {
                TimeUnit::Hour => 'h',
                TimeUnit::Day => 'd',
                TimeUnit::Week => 'w',
                TimeUnit::Month => 'm',
                TimeUnit::Year => 'y',
            }
        }
    }

    /* ------------------------------ Drawers ------------------------------ */

    /// Property drawer. Keys are unique case-insensitively and keep their source case.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PropertyDrawer {
        /// Indentation shared by every line of the drawer.
        #[serde(default)]
        pub indent: String,
        /// Keyed by the uppercased property name.
        #[serde(default)]
        pub properties: IndexMap<String, Property>,
    }

    impl PropertyDrawer {
        pub fn get(&self, key: &str) -> Option<&str> {
            self.properties
                .get(&key.to_uppercase())
                .map(|p| p.value.as_str())
        }

        /// Inserts or replaces a property; an existing entry keeps its position.
        pub fn set(&mut self, key: &str, value: &str) {
            let slot = key.to_uppercase();
            match self.properties.get_mut(&slot) {
                Some(existing) => existing.value = value.to_string(),
                None => {
                    self.properties.insert(
                        slot,
                        Property {
                            key: key.to_string(),
                            separator: " ".to_string(),
                            value: value.to_string(),
                        },
                    );
                }
            }
        }

        pub fn len(&self) -> usize {
            self.properties.len()
        }

        pub fn is_empty(&self) -> bool {
            self.properties.is_empty()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Property {
        /// Key as written in the file.
        pub key: String,
        /// Whitespace between `:KEY:` and the value (Emacs pads to align values).
        pub separator: String,
        pub value: String,
    }

    /// Logbook drawer: clock entries and state-change notes, newest first.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Logbook {
        #[serde(default)]
        pub indent: String,
        #[serde(default)]
        pub entries: Vec<LogbookEntry>,
    }

    impl Logbook {
        /// Records a new entry at the top of the drawer.
        pub fn record(&mut self, entry: LogbookEntry) {
            self.entries.insert(0, entry);
        }

        pub fn clocks(&self) -> impl Iterator<Item = &ClockEntry> + '_ {
            self.entries.iter().filter_map(|e| match e {
                LogbookEntry::Clock(clock) => Some(clock),
                LogbookEntry::Note(_) => None,
            })
        }

        /// Sum of the re-derived durations of all closed clocks.
        pub fn total_minutes(&self) -> i64 {
            self.clocks().filter_map(ClockEntry::minutes).sum()
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum LogbookEntry {
        Clock(ClockEntry),
        /// State-change note or any other line, verbatim.
        Note(String),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ClockEntry {
        #[serde(default)]
        pub indent: String,
        pub start: Timestamp,
        /// `None` for a running clock.
        pub end: Option<Timestamp>,
        /// Literal text after `=>`, padding included (e.g. `"  1:30"`).
        pub duration: Option<String>,
    }

    impl ClockEntry {
        /// Duration re-derived from the two timestamps.
        pub fn minutes(&self) -> Option<i64> {
            let end = self.end.as_ref()?;
            let start = self.start.date.and_time(self.start.start?);
            let stop = end.date.and_time(end.start?);
            Some((stop - start).num_minutes())
        }

        /// Duration as recorded after `=>`; `None` when it does not fit an `i64`.
        pub fn recorded_minutes(&self) -> Option<i64> {
            let text = self.duration.as_deref()?.trim();
            let (negative, text) = match text.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, text),
            };
            let (hours, minutes) = text.split_once(':')?;
            let total = hours
                .parse::<i64>()
                .ok()?
                .checked_mul(60)?
                .checked_add(minutes.parse::<i64>().ok()?)?;
            Some(if negative { -total } else { total })
        }
    }

    /// Renders minutes the way clock lines do (`1:05`).
    pub fn format_minutes(minutes: i64) -> String {
        let sign = if minutes < 0 { "-" } else { "" };
        let minutes = minutes.abs();
        format!("{sign}{}:{:02}", minutes / 60, minutes % 60)
    }

    /* ---------------------------- Content Model ---------------------------- */

    /// Raw text together with its inline spans. Concatenating the spans' source text
    /// gives back `raw`.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct RichText {
        pub raw: String,
        #[serde(default)]
        pub spans: Vec<InlineSpan>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum InlineSpan {
        PlainText(String),
        Emphasis {
            kind: EmphasisKind,
            content: String,
        },
        Link {
            target: String,
            description: Option<String>,
        },
        RawUrl(String),
        Email(String),
        Phone(String),
        Cookie(Cookie),
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum EmphasisKind {
        Bold,
        Italic,
        Underline,
        Verbatim,
        Strike,
        Code,
    }

    impl EmphasisKind {
        pub fn from_marker(c: char) -> Option<Self> {
            match c {
                '*' => Some(EmphasisKind::Bold),
                '/' => Some(EmphasisKind::Italic),
                '_' => Some(EmphasisKind::Underline),
                '=' => Some(EmphasisKind::Verbatim),
                '+' => Some(EmphasisKind::Strike),
                '~' => Some(EmphasisKind::Code),
                _ => None,
            }
        }

        pub fn marker(self) -> char {
            match self {
                EmphasisKind::Bold => '*',
                EmphasisKind::Italic => '/',
                EmphasisKind::Underline => '_',
                EmphasisKind::Verbatim => '=',
                EmphasisKind::Strike => '+',
                EmphasisKind::Code => '~',
            }
        }
    }

    /// Progress cookie; empty cookies (`[%]`, `[/]`) have no values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub enum Cookie {
        Percentage(Option<u32>),
        Fraction {
            done: Option<u32>,
            total: Option<u32>,
        },
    }

    /* ---------------------------- Diagnostics ---------------------------- */

    /// Content the parser kept as plain text, or kept but could not verify.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
    pub enum ParseWarning {
        #[error("line {line}: malformed :{drawer}: drawer ({defect}); kept as plain content")]
        MalformedDrawer {
            line: usize,
            drawer: String,
            defect: DrawerDefect,
        },
        #[error("line {line}: clock duration {recorded} does not match derived {derived}")]
        ClockDurationMismatch {
            line: usize,
            recorded: String,
            derived: String,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum DrawerDefect {
        /// No `:END:` with matching indentation before the next heading.
        Unterminated,
        /// A line that does not belong in the drawer.
        UnexpectedLine { line: usize },
        DuplicateKey(String),
    }

    impl fmt::Display for DrawerDefect {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                DrawerDefect::Unterminated => write!(f, "no matching :END:"),
                DrawerDefect::UnexpectedLine { line } => write!(f, "unexpected line {line}"),
                DrawerDefect::DuplicateKey(key) => write!(f, "duplicate property {key}"),
            }
        }
    }

    /* ---------------------------- Errors (caller) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum QueryError {
        #[error("heading index {index} is out of range (document has {count} headings)")]
        HeadingOutOfRange { index: usize, count: usize },
        #[error("unknown configuration flag {0:?}")]
        UnknownFlag(String),
    }

    /// A document that the exporter cannot render without breaking the round trip.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ExportError {
        #[error("heading {heading:?}: level {level} must be at least 1")]
        InvalidLevel { heading: HeadingId, level: usize },
        #[error("heading {heading:?}: level {level} is not deeper than its parent ({parent_level})")]
        LevelJump {
            heading: HeadingId,
            level: usize,
            parent_level: usize,
        },
        #[error("heading {heading:?}: title spans more than one line")]
        MultilineTitle { heading: HeadingId },
        #[error("heading {heading:?}: invalid tag {tag:?}")]
        InvalidTag { heading: HeadingId, tag: String },
        #[error("heading {heading:?}: keyword {keyword:?} is not in any keyword set")]
        UnknownKeyword { heading: HeadingId, keyword: String },
        #[error("heading {heading:?}: property key {key:?} is filed under {slot:?}")]
        PropertyKeyMismatch {
            heading: HeadingId,
            key: String,
            slot: String,
        },
        #[error("heading {heading:?}: description must end with a newline before more headings")]
        UnterminatedDescription { heading: HeadingId },
        #[error("heading {heading:?}: rich text spans do not reproduce the raw text")]
        SpanMismatch { heading: HeadingId },
    }
}

pub mod classify {
    //! Single-line classification. Pure, no lookahead; lines are sliced, never rewritten.

    /// What a raw line (without its terminator) looks like on its own.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum LineKind<'a> {
        /// `*** rest`: stars followed by one space.
        Heading { level: usize, rest: &'a str },
        /// `#+KEY: value`
        FileConfig { key: &'a str, value: &'a str },
        /// `:NAME:` alone on the line.
        DrawerOpen { indent: &'a str, name: &'a str },
        /// `:END:` alone on the line.
        DrawerEnd { indent: &'a str },
        /// `:KEY: value`
        Property {
            indent: &'a str,
            key: &'a str,
            separator: &'a str,
            value: &'a str,
        },
        /// Starts with SCHEDULED:, DEADLINE: or CLOSED:.
        Planning { indent: &'a str },
        /// Starts with `CLOCK:`.
        Clock { indent: &'a str },
        Blank,
        Text,
    }

    pub fn classify(line: &str) -> LineKind<'_> {
        if let Some((level, rest)) = heading(line) {
            return LineKind::Heading { level, rest };
        }
        if let Some((key, value)) = file_config(line) {
            return LineKind::FileConfig { key, value };
        }

        let (indent, body) = split_indent(line);
        if body.is_empty() {
            return LineKind::Blank;
        }
        if body == ":END:" {
            return LineKind::DrawerEnd { indent };
        }
        if let Some(name) = drawer_name(body) {
            return LineKind::DrawerOpen { indent, name };
        }
        if let Some((key, separator, value)) = property(body) {
            return LineKind::Property {
                indent,
                key,
                separator,
                value,
            };
        }
        if ["SCHEDULED:", "DEADLINE:", "CLOSED:"]
            .iter()
            .any(|kw| body.starts_with(kw))
        {
            return LineKind::Planning { indent };
        }
        if body.starts_with("CLOCK:") {
            return LineKind::Clock { indent };
        }
        LineKind::Text
    }

    pub(crate) fn is_blank(c: char) -> bool {
        c == ' ' || c == '\t'
    }

    /// Splits leading spaces/tabs from the rest of the line.
    pub fn split_indent(line: &str) -> (&str, &str) {
        let body = line.trim_start_matches(is_blank);
        line.split_at(line.len() - body.len())
    }

    fn heading(line: &str) -> Option<(usize, &str)> {
        let level = line.bytes().take_while(|b| *b == b'*').count();
        if level == 0 {
            return None;
        }
        line[level..].strip_prefix(' ').map(|rest| (level, rest))
    }

    fn file_config(line: &str) -> Option<(&str, &str)> {
        let rest = line.strip_prefix("#+")?;
        let key_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        if key_len == 0 {
            return None;
        }
        let value = rest[key_len..].strip_prefix(':')?;
        Some((&rest[..key_len], value.trim_start_matches(is_blank)))
    }

    fn drawer_name(body: &str) -> Option<&str> {
        let name = body.strip_prefix(':')?.strip_suffix(':')?;
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        valid.then_some(name)
    }

    fn property(body: &str) -> Option<(&str, &str, &str)> {
        let rest = body.strip_prefix(':')?;
        let key_len = rest.find(|c: char| c == ':' || c.is_whitespace())?;
        if key_len == 0 || !rest[key_len..].starts_with(':') {
            return None;
        }
        let key = &rest[..key_len];
        let after = &rest[key_len + 1..];
        let value = after.trim_start_matches(is_blank);
        let separator = &after[..after.len() - value.len()];
        if separator.is_empty() && !value.is_empty() {
            return None;
        }
        Some((key, separator, value))
    }

}

pub mod timestamp {
    use super::PResult;
    use super::core::*;
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, digit1, one_of},
        combinator::{all_consuming, map, map_opt, map_res, opt, verify},
        error::{VerboseError, VerboseErrorKind},
        sequence::{preceded, tuple},
    };
    use std::fmt;

    impl Timestamp {
        /// A date-only timestamp.
        pub fn on(date: NaiveDate, active: bool) -> Self {
            Self {
                active,
                date,
                weekday: None,
                start: None,
                end: None,
                repeater: None,
                delay: None,
            }
        }

        /// Parses a complete timestamp such as `<2019-07-30 Tue 10:00 +1w>`.
        pub fn parse(text: &str) -> Option<Self> {
            all_consuming(parse_timestamp)(text).ok().map(|(_, ts)| ts)
        }
    }

    /// Parses one timestamp. Only the canonical spelling is accepted, so the
    /// rendered form always equals the consumed text.
    pub(crate) fn parse_timestamp(i: &str) -> PResult<'_, Timestamp> {
        let start = i;
        let (i, (open, date, weekday, times, repeater, delay, close)) = tuple((
            one_of("<["),
            parse_date,
            opt(preceded(char(' '), parse_weekday)),
            opt(preceded(char(' '), parse_time_range)),
            opt(preceded(char(' '), parse_repeater)),
            opt(preceded(char(' '), parse_delay)),
            one_of(">]"),
        ))(i)?;

        let active = open == '<';
        let (start_time, end) = match times {
            Some((from, to)) => (Some(from), to),
            None => (None, None),
        };
        let ts = Timestamp {
            active,
            date,
            weekday,
            start: start_time,
            end,
            repeater,
            delay,
        };

        let consumed = &start[..start.len() - i.len()];
        let expected_close = if active { '>' } else { ']' };
        if close != expected_close || ts.to_string() != consumed {
            return Err(nom::Err::Error(VerboseError {
                errors: vec![(start, VerboseErrorKind::Context("timestamp"))],
            }));
        }
        Ok((i, ts))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_opt(
            tuple((
                take_while_m_n(4, 4, is_digit),
                char('-'),
                take_while_m_n(2, 2, is_digit),
                char('-'),
                take_while_m_n(2, 2, is_digit),
            )),
            |(y, _, m, _, d): (&str, char, &str, char, &str)| {
                NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
            },
        )(i)
    }

    fn parse_weekday(i: &str) -> PResult<'_, String> {
        map(
            take_while1(|c: char| c.is_alphabetic() || c == '.'),
            |s: &str| s.to_string(),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_opt(
            tuple((
                take_while_m_n(2, 2, is_digit),
                char(':'),
                take_while_m_n(2, 2, is_digit),
            )),
            |(h, _, m): (&str, char, &str)| {
                NaiveTime::from_hms_opt(h.parse().ok()?, m.parse().ok()?, 0)
            },
        )(i)
    }

    fn parse_time_range(i: &str) -> PResult<'_, (NaiveTime, Option<NaiveTime>)> {
        tuple((parse_time, opt(preceded(char('-'), parse_time))))(i)
    }

    fn parse_repeater(i: &str) -> PResult<'_, Repeater> {
        map(
            tuple((alt((tag("++"), tag(".+"), tag("+"))), number, parse_unit)),
            |(mark, value, unit): (&str, u32, TimeUnit)| Repeater {
                kind: match mark {
                    "++" => RepeaterKind::CatchUp,
                    ".+" => RepeaterKind::Restart,
                    _ => RepeaterKind::Cumulate,
                },
                value,
                unit,
            },
        )(i)
    }

    fn parse_delay(i: &str) -> PResult<'_, Delay> {
        map(
            tuple((alt((tag("--"), tag("-"))), number, parse_unit)),
            |(mark, value, unit): (&str, u32, TimeUnit)| Delay {
                kind: if mark == "--" {
                    DelayKind::First
                } else {
                    DelayKind::All
                },
                value,
                unit,
            },
        )(i)
    }

    fn parse_unit(i: &str) -> PResult<'_, TimeUnit> {
        map_opt(one_of("hdwmy"), TimeUnit::from_char)(i)
    }

    /// Decimal number without leading zeros (`0` itself is fine).
    pub(crate) fn number(i: &str) -> PResult<'_, u32> {
        map_res(
            verify(digit1, |s: &str| s == "0" || !s.starts_with('0')),
            |s: &str| s.parse::<u32>(),
        )(i)
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    impl fmt::Display for Timestamp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let (open, close) = if self.active { ('<', '>') } else { ('[', ']') };
            write!(f, "{open}{}", self.date.format("%Y-%m-%d"))?;
            if let Some(day) = &self.weekday {
                write!(f, " {day}")?;
            }
            if let Some(start) = self.start {
                write!(f, " {}", start.format("%H:%M"))?;
                if let Some(end) = self.end {
                    write!(f, "-{}", end.format("%H:%M"))?;
                }
            }
            if let Some(repeater) = &self.repeater {
                write!(f, " {repeater}")?;
            }
            if let Some(delay) = &self.delay {
                write!(f, " {delay}")?;
            }
            write!(f, "{close}")
        }
    }

    impl fmt::Display for Repeater {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mark = match self.kind {
                RepeaterKind::Cumulate => "+",
                RepeaterKind::CatchUp => "++",
                RepeaterKind::Restart => ".+",
            };
            write!(f, "{mark}{}{}", self.value, self.unit.as_char())
        }
    }

    impl fmt::Display for Delay {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mark = match self.kind {
                DelayKind::All => "-",
                DelayKind::First => "--",
            };
            write!(f, "{mark}{}{}", self.value, self.unit.as_char())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_full_active_timestamp() {
            let ts = Timestamp::parse("<2019-07-30 Tue 10:00-11:30 .+1w --2d>").unwrap();
            assert!(ts.active);
            assert_eq!(ts.date, NaiveDate::from_ymd_opt(2019, 7, 30).unwrap());
            assert_eq!(ts.weekday.as_deref(), Some("Tue"));
            assert_eq!(ts.start, NaiveTime::from_hms_opt(10, 0, 0));
            assert_eq!(ts.end, NaiveTime::from_hms_opt(11, 30, 0));
            assert_eq!(
                ts.repeater,
                Some(Repeater {
                    kind: RepeaterKind::Restart,
                    value: 1,
                    unit: TimeUnit::Week
                })
            );
            assert_eq!(ts.delay.map(|d| d.kind), Some(DelayKind::First));
        }

        #[test]
        fn inactive_and_localized_weekday_render_back() {
            for text in [
                "[2024-02-29 Do 09:05]",
                "[2024-02-29]",
                "<2020-01-01 mié.>",
                "<2019-07-30 Tue ++0d>",
            ] {
                let ts = Timestamp::parse(text).unwrap();
                assert_eq!(ts.to_string(), text);
            }
        }

        #[test]
        fn rejects_non_canonical_spellings() {
            for text in [
                "<2019-07-30  Tue>",
                "<2019-07-30 Tue 9:00>",
                "<2019-07-30 Tue +01w>",
                "<2019-02-30 Sat>",
                "<2019-07-30 Tue]",
                "<2019-7-30>",
                "<2019-07-30 Tue 10:00 +1x>",
            ] {
                assert!(Timestamp::parse(text).is_none(), "{text}");
            }
        }

        #[test]
        fn leaves_trailing_input_unconsumed() {
            let (rest, ts) = parse_timestamp("<2019-07-30 Tue> DEADLINE").unwrap();
            assert_eq!(rest, " DEADLINE");
            assert_eq!(ts.weekday.as_deref(), Some("Tue"));
        }
    }
}

pub mod inline {
    //! Inline markup tokenizer.
    //!
    //! At each position the matchers in [`MATCHERS`] are tried in order; the first hit
    //! wins and consumes its whole extent. Positions nothing claims become plain text.

    use super::PResult;
    use super::core::*;
    use super::timestamp::number;
    use nom::{
        branch::alt,
        bytes::complete::{is_not, tag},
        character::complete::char,
        combinator::{map, opt},
        sequence::{delimited, preceded, separated_pair},
    };
    use std::fmt;

    type Matcher = fn(&Scan<'_>, usize) -> Option<(InlineSpan, usize)>;

    /// Priority order. Links and autolinks come before emphasis so that `/` or `=`
    /// inside a URL never opens or closes markup.
    const MATCHERS: [Matcher; 6] = [link, raw_url, email, phone, cookie, emphasis];

    const URL_SCHEMES: [&str; 4] = ["https://", "http://", "ftp://", "mailto:"];

    const EMPHASIS_MARKERS: [char; 6] = ['*', '/', '_', '=', '+', '~'];
    /// Characters allowed right before an emphasis opener (besides whitespace).
    const EMPHASIS_PRE: &str = "-('\"{";
    /// Characters allowed right after an emphasis closer (besides whitespace).
    const EMPHASIS_POST: &str = "-.,;:!?'\")}[\\";

    /// Lookup tables built once per line so that no matcher rescans the rest of it.
    struct Scan<'a> {
        line: &'a str,
        /// Byte offsets of every `]]`, overlapping ones included.
        link_ends: Vec<usize>,
        /// Valid closing positions per entry of `EMPHASIS_MARKERS`, ascending.
        closers: [Vec<usize>; 6],
    }

    impl<'a> Scan<'a> {
        fn new(line: &'a str) -> Self {
            let link_ends = line
                .as_bytes()
                .windows(2)
                .enumerate()
                .filter(|(_, pair)| *pair == b"]]")
                .map(|(at, _)| at)
                .collect();
            let mut scan = Scan {
                line,
                link_ends,
                closers: Default::default(),
            };

            // Closers inside links, URLs and e-mail addresses do not count.
            let mut closers: [Vec<usize>; 6] = Default::default();
            let mut opaque_end = 0;
            for (at, c) in line.char_indices() {
                if at >= opaque_end {
                    if let Some(len) = scan.opaque(at) {
                        opaque_end = at + len;
                    }
                }
                if at < opaque_end {
                    continue;
                }
                if let Some(slot) = marker_slot(c) {
                    if scan.closes_emphasis(at, c) {
                        closers[slot].push(at);
                    }
                }
            }
            scan.closers = closers;
            scan
        }

        /// Extent of a span that emphasis must not look inside.
        fn opaque(&self, pos: usize) -> Option<usize> {
            [link as Matcher, raw_url, email]
                .iter()
                .find_map(|m| m(self, pos))
                .map(|(_, len)| len)
        }

        fn closes_emphasis(&self, at: usize, marker: char) -> bool {
            let before_ok = prev_char(self.line, at).is_some_and(|b| !b.is_whitespace());
            let after_ok = self.line[at + marker.len_utf8()..]
                .chars()
                .next()
                .is_none_or(|a| a.is_whitespace() || EMPHASIS_POST.contains(a));
            before_ok && after_ok
        }

        /// First entry of `sorted` that is at least `from`.
        fn first_from(sorted: &[usize], from: usize) -> Option<usize> {
            sorted.get(sorted.partition_point(|&at| at < from)).copied()
        }
    }

    fn marker_slot(c: char) -> Option<usize> {
        EMPHASIS_MARKERS.iter().position(|m| *m == c)
    }

    /// Splits one line into spans whose source text concatenates back to `line`.
    ///
    /// Runs in time linear in the line length, up to a logarithmic factor.
    pub fn tokenize(line: &str) -> Vec<InlineSpan> {
        let scan = Scan::new(line);
        let mut spans = Vec::new();
        let mut plain = String::new();
        let mut pos = 0;

        'scan: while pos < line.len() {
            for matcher in MATCHERS {
                if let Some((span, len)) = matcher(&scan, pos) {
                    if !plain.is_empty() {
                        spans.push(InlineSpan::PlainText(std::mem::take(&mut plain)));
                    }
                    spans.push(span);
                    pos += len;
                    continue 'scan;
                }
            }
            let Some(c) = line[pos..].chars().next() else {
                break;
            };
            plain.push(c);
            pos += c.len_utf8();
        }

        if !plain.is_empty() {
            spans.push(InlineSpan::PlainText(plain));
        }
        spans
    }

    fn prev_char(line: &str, pos: usize) -> Option<char> {
        line[..pos].chars().next_back()
    }

    /* ------------------------------ Matchers ------------------------------ */

    /// `[[target]]` or `[[target][description]]`.
    fn link(scan: &Scan<'_>, pos: usize) -> Option<(InlineSpan, usize)> {
        let input = &scan.line[pos..];
        let (rest, target) = link_target(input).ok()?;
        let target_end = pos + input.len() - rest.len();
        if rest.starts_with("]]") {
            let span = InlineSpan::Link {
                target: target.to_string(),
                description: None,
            };
            return Some((span, target_end + 2 - pos));
        }

        rest.strip_prefix("][")?;
        let description_start = target_end + 2;
        let end = Scan::first_from(&scan.link_ends, description_start)?;
        let span = InlineSpan::Link {
            target: target.to_string(),
            description: Some(scan.line[description_start..end].to_string()),
        };
        Some((span, end + 2 - pos))
    }

    fn link_target(i: &str) -> PResult<'_, &str> {
        preceded(tag("[["), is_not("[]"))(i)
    }

    fn raw_url(scan: &Scan<'_>, pos: usize) -> Option<(InlineSpan, usize)> {
        let line = scan.line;
        if prev_char(line, pos).is_some_and(char::is_alphanumeric) {
            return None;
        }
        let rest = &line[pos..];
        let scheme = URL_SCHEMES.iter().find(|s| rest.starts_with(**s))?;
        let end = rest
            .find(|c: char| c.is_whitespace() || "<>\"[]".contains(c))
            .unwrap_or(rest.len());

        let mut url = &rest[..end];
        let opening = url.matches('(').count();
        let mut closing = url.matches(')').count();
        loop {
            if let Some(trimmed) = url.strip_suffix(|c: char| ".,;:!?'".contains(c)) {
                url = trimmed;
            } else if url.ends_with(')') && opening < closing {
                url = &url[..url.len() - 1];
                closing -= 1;
            } else {
                break;
            }
        }

        if url.len() <= scheme.len() {
            return None;
        }
        Some((InlineSpan::RawUrl(url.to_string()), url.len()))
    }

    fn is_email_local(c: char) -> bool {
        c.is_ascii_alphanumeric() || "._%+-".contains(c)
    }

    fn email(scan: &Scan<'_>, pos: usize) -> Option<(InlineSpan, usize)> {
        let line = scan.line;
        if prev_char(line, pos).is_some_and(is_email_local) {
            return None;
        }
        let rest = &line[pos..];
        let local_len = rest
            .find(|c: char| !is_email_local(c))
            .unwrap_or(rest.len());
        if local_len == 0 || !rest[local_len..].starts_with('@') {
            return None;
        }

        let domain_start = local_len + 1;
        let tail = &rest[domain_start..];
        let domain_len = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '.' || c == '-'))
            .unwrap_or(tail.len());
        let domain = tail[..domain_len].trim_end_matches(['.', '-']);
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
            return None;
        }

        let len = domain_start + domain.len();
        Some((InlineSpan::Email(rest[..len].to_string()), len))
    }

    fn phone(scan: &Scan<'_>, pos: usize) -> Option<(InlineSpan, usize)> {
        let line = scan.line;
        if prev_char(line, pos).is_some_and(|c| c.is_alphanumeric() || c == '+') {
            return None;
        }
        let bytes = line[pos..].as_bytes();
        if bytes.first() != Some(&b'+') || !bytes.get(1).is_some_and(u8::is_ascii_digit) {
            return None;
        }

        let mut digits = 0;
        let mut end = 1;
        let mut i = 1;
        while let Some(b) = bytes.get(i) {
            match b {
                b'0'..=b'9' => {
                    digits += 1;
                    i += 1;
                    end = i;
                }
                b'-' | b'.' | b'(' | b')' | b'/' => i += 1,
                b' ' if bytes
                    .get(i + 1)
                    .is_some_and(|n| n.is_ascii_digit() || *n == b'(') =>
                {
                    i += 1
                }
                _ => break,
            }
        }

        if !(7..=15).contains(&digits) {
            return None;
        }
        let text = &line[pos..pos + end];
        if line[pos + end..]
            .chars()
            .next()
            .is_some_and(char::is_alphanumeric)
        {
            return None;
        }
        Some((InlineSpan::Phone(text.to_string()), end))
    }

    fn cookie(scan: &Scan<'_>, pos: usize) -> Option<(InlineSpan, usize)> {
        let input = &scan.line[pos..];
        let (rest, cookie) = parse_cookie(input).ok()?;
        Some((InlineSpan::Cookie(cookie), input.len() - rest.len()))
    }

    fn parse_cookie(i: &str) -> PResult<'_, Cookie> {
        alt((
            map(
                delimited(char('['), opt(number), tag("%]")),
                Cookie::Percentage,
            ),
            map(
                delimited(
                    char('['),
                    separated_pair(opt(number), char('/'), opt(number)),
                    char(']'),
                ),
                |(done, total): (Option<u32>, Option<u32>)| Cookie::Fraction { done, total },
            ),
        ))(i)
    }

    fn emphasis(scan: &Scan<'_>, pos: usize) -> Option<(InlineSpan, usize)> {
        let line = scan.line;
        let marker = line[pos..].chars().next()?;
        let kind = EmphasisKind::from_marker(marker)?;
        if prev_char(line, pos).is_some_and(|c| !(c.is_whitespace() || EMPHASIS_PRE.contains(c))) {
            return None;
        }
        let body_start = pos + marker.len_utf8();
        if line[body_start..]
            .chars()
            .next()
            .is_none_or(char::is_whitespace)
        {
            return None;
        }

        let closers = &scan.closers[marker_slot(marker)?];
        let at = Scan::first_from(closers, body_start + 1)?;
        let span = InlineSpan::Emphasis {
            kind,
            content: line[body_start..at].to_string(),
        };
        Some((span, at + marker.len_utf8() - pos))
    }

    /* ------------------------------ Rendering ------------------------------ */

    impl fmt::Display for InlineSpan {
        /// Writes the span's exact source text.
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                InlineSpan::PlainText(text)
                | InlineSpan::RawUrl(text)
                | InlineSpan::Email(text)
                | InlineSpan::Phone(text) => f.write_str(text),
                InlineSpan::Emphasis { kind, content } => {
                    let m = kind.marker();
                    write!(f, "{m}{content}{m}")
                }
                InlineSpan::Link {
                    target,
                    description: Some(desc),
                } => write!(f, "[[{target}][{desc}]]"),
                InlineSpan::Link {
                    target,
                    description: None,
                } => write!(f, "[[{target}]]"),
                InlineSpan::Cookie(cookie) => write!(f, "{cookie}"),
            }
        }
    }

    impl fmt::Display for Cookie {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let show = |n: &Option<u32>| n.map(|v| v.to_string()).unwrap_or_default();
            match self {
                Cookie::Percentage(p) => write!(f, "[{}%]", show(p)),
                Cookie::Fraction { done, total } => write!(f, "[{}/{}]", show(done), show(total)),
            }
        }
    }

    impl InlineSpan {
        /// Text a reader sees, with markup removed.
        pub fn plain_text(&self) -> String {
            match self {
                InlineSpan::Emphasis { content, .. } => content.clone(),
                InlineSpan::Link {
                    target,
                    description,
                } => description.clone().unwrap_or_else(|| target.clone()),
                other => other.to_string(),
            }
        }
    }

    impl RichText {
        /// Tokenizes every line of `raw`; line breaks become plain text.
        pub fn parse(raw: &str) -> Self {
            let mut spans: Vec<InlineSpan> = Vec::new();
            let push_plain = |spans: &mut Vec<InlineSpan>, text: &str| match spans.last_mut() {
                Some(InlineSpan::PlainText(last)) => last.push_str(text),
                _ => spans.push(InlineSpan::PlainText(text.to_string())),
            };

            for (n, line) in raw.split('\n').enumerate() {
                if n > 0 {
                    push_plain(&mut spans, "\n");
                }
                for span in tokenize(line) {
                    match span {
                        InlineSpan::PlainText(text) => push_plain(&mut spans, &text),
                        other => spans.push(other),
                    }
                }
            }

            Self {
                raw: raw.to_string(),
                spans,
            }
        }

        /// Concatenation of the spans' source text.
        pub fn render(&self) -> String {
            self.spans.iter().map(ToString::to_string).collect()
        }

        pub fn plain_text(&self) -> String {
            self.spans.iter().map(InlineSpan::plain_text).collect()
        }

        pub fn is_empty(&self) -> bool {
            self.raw.is_empty()
        }

        pub(crate) fn is_consistent(&self) -> bool {
            self.render() == self.raw
        }
    }

    impl From<&str> for RichText {
        fn from(raw: &str) -> Self {
            RichText::parse(raw)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn joined(spans: &[InlineSpan]) -> String {
            spans.iter().map(ToString::to_string).collect()
        }

        #[test]
        fn emphasis_closes_before_allowed_punctuation() {
            let spans = tokenize("*bold*;");
            assert_eq!(
                spans,
                vec![
                    InlineSpan::Emphasis {
                        kind: EmphasisKind::Bold,
                        content: "bold".into()
                    },
                    InlineSpan::PlainText(";".into()),
                ]
            );
        }

        #[test]
        fn url_slashes_do_not_open_italics() {
            let line = "/italic/ word http://example.com/ text";
            let spans = tokenize(line);
            assert_eq!(spans.len(), 4);
            assert_eq!(spans[2], InlineSpan::RawUrl("http://example.com/".into()));
            assert_eq!(joined(&spans), line);
        }

        #[test]
        fn url_query_does_not_close_verbatim() {
            let line = "=verb=: http://example.com/?a=b";
            let spans = tokenize(line);
            assert_eq!(spans.len(), 3);
            assert_eq!(
                spans[0],
                InlineSpan::Emphasis {
                    kind: EmphasisKind::Verbatim,
                    content: "verb".into()
                }
            );
            assert_eq!(spans[1], InlineSpan::PlainText(": ".into()));
            assert_eq!(joined(&spans), line);
        }

        #[test]
        fn links_with_and_without_description() {
            let spans = tokenize("see [[https://orgmode.org][Org]] and [[file:notes.org]]");
            assert_eq!(
                spans[1],
                InlineSpan::Link {
                    target: "https://orgmode.org".into(),
                    description: Some("Org".into())
                }
            );
            assert_eq!(
                spans[3],
                InlineSpan::Link {
                    target: "file:notes.org".into(),
                    description: None
                }
            );
        }

        #[test]
        fn autolinks_trim_trailing_punctuation() {
            let spans = tokenize("(see http://a.com/x_(y)). mail bob.smith@example.co.uk.");
            assert!(spans.contains(&InlineSpan::RawUrl("http://a.com/x_(y)".into())));
            assert!(spans.contains(&InlineSpan::Email("bob.smith@example.co.uk".into())));
            assert_eq!(
                joined(&spans),
                "(see http://a.com/x_(y)). mail bob.smith@example.co.uk."
            );
        }

        #[test]
        fn phone_numbers_need_seven_digits() {
            let spans = tokenize("call +1 (555) 123-4567 or +12");
            assert_eq!(spans[1], InlineSpan::Phone("+1 (555) 123-4567".into()));
            assert!(!spans.iter().any(|s| *s == InlineSpan::Phone("+12".into())));
        }

        #[test]
        fn cookies_allow_empty_values() {
            assert_eq!(
                tokenize("[33%]"),
                vec![InlineSpan::Cookie(Cookie::Percentage(Some(33)))]
            );
            assert_eq!(
                tokenize("[/]"),
                vec![InlineSpan::Cookie(Cookie::Fraction {
                    done: None,
                    total: None
                })]
            );
            assert_eq!(tokenize("[1/3]")[0].to_string(), "[1/3]");
            assert_eq!(tokenize("[01/3]"), vec![InlineSpan::PlainText("[01/3]".into())]);
        }

        #[test]
        fn malformed_markup_degrades_to_plain_text() {
            for line in ["a*b*", "* not bold *", "**", "= =", "x /y/z", "[[unclosed"] {
                assert_eq!(
                    tokenize(line),
                    vec![InlineSpan::PlainText(line.into())],
                    "{line}"
                );
            }
            assert!(tokenize("").is_empty());
        }

        #[test]
        fn long_lines_of_unclosed_markup_tokenize_quickly() {
            use std::time::{Duration, Instant};

            for unit in ["*a ", "/a =b ~c ", "[[a][", "http://a.b/x) ", "x@y.z +1 "] {
                let line = unit.repeat(20_000);
                let started = Instant::now();
                let spans = tokenize(&line);
                let elapsed = started.elapsed();
                assert_eq!(joined(&spans), line, "{unit}");
                assert!(
                    elapsed < Duration::from_secs(3),
                    "{unit:?} x 20000 took {elapsed:?}"
                );
            }
        }

        #[test]
        fn markup_inside_a_url_does_not_close_emphasis() {
            let line = "*see http://a.com/x* and more*";
            let spans = tokenize(line);
            assert_eq!(
                spans[0],
                InlineSpan::Emphasis {
                    kind: EmphasisKind::Bold,
                    content: "see http://a.com/x* and more".into()
                }
            );
            assert_eq!(joined(&spans), line);
        }

        #[test]
        fn rich_text_merges_plain_runs_across_lines() {
            let text = RichText::parse("first line\n  - item ~code~\n");
            assert_eq!(text.spans.len(), 3);
            assert_eq!(text.render(), text.raw);
            assert_eq!(text.plain_text(), "first line\n  - item code\n");
        }
    }
}

pub mod planning {
    use super::PResult;
    use super::classify::split_indent;
    use super::core::*;
    use super::timestamp::parse_timestamp;
    use nom::{
        branch::alt,
        bytes::complete::tag,
        character::complete::char,
        combinator::{all_consuming, map, value},
        multi::separated_list1,
        sequence::separated_pair,
    };
    use serde::Serialize;

    /// Result of [`parse_planning_items`].
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct PlanningExtraction {
        pub planning: Option<Planning>,
        pub stripped_description: String,
    }

    /// Pulls a planning line off the front of a heading's description.
    ///
    /// Only the first line is examined. When it is a planning line it is removed together
    /// with its newline; every other byte of the description is left untouched.
    pub fn parse_planning_items(description: &str) -> PlanningExtraction {
        let (first, rest) = match description.split_once('\n') {
            Some((first, rest)) => (first, rest),
            None => (description, ""),
        };
        match parse_planning_line(first) {
            Some(planning) => PlanningExtraction {
                planning: Some(planning),
                stripped_description: rest.to_string(),
            },
            None => PlanningExtraction {
                planning: None,
                stripped_description: description.to_string(),
            },
        }
    }

    /// `SCHEDULED: <...> DEADLINE: <...>` with single spaces and no repeated kind.
    pub(crate) fn parse_planning_line(line: &str) -> Option<Planning> {
        let (indent, body) = split_indent(line);
        let (_, items) = all_consuming(planning_items)(body).ok()?;
        for (n, item) in items.iter().enumerate() {
            if items[..n].iter().any(|seen| seen.kind == item.kind) {
                return None;
            }
        }
        Some(Planning {
            indent: indent.to_string(),
            items,
        })
    }

    fn planning_items(i: &str) -> PResult<'_, Vec<PlanningItem>> {
        separated_list1(char(' '), planning_item)(i)
    }

    fn planning_item(i: &str) -> PResult<'_, PlanningItem> {
        map(
            separated_pair(planning_kind, tag(": "), parse_timestamp),
            |(kind, timestamp)| PlanningItem { kind, timestamp },
        )(i)
    }

    fn planning_kind(i: &str) -> PResult<'_, PlanningKind> {
        alt((
            value(PlanningKind::Scheduled, tag("SCHEDULED")),
            value(PlanningKind::Deadline, tag("DEADLINE")),
            value(PlanningKind::Closed, tag("CLOSED")),
        ))(i)
    }

}

pub mod drawer {
    //! `:PROPERTIES:` and `:LOGBOOK:` drawers directly below a headline or planning line.
    //!
    //! A drawer only counts when every line shares the opener's indentation and an
    //! `:END:` closes it. Anything else is reported as a warning and left as text.

    use super::PResult;
    use super::classify::{LineKind, classify, split_indent};
    use super::core::*;
    use super::timestamp::parse_timestamp;
    use indexmap::IndexMap;
    use nom::{
        bytes::complete::{tag, take_while_m_n},
        character::complete::{char, digit1, space1},
        combinator::{all_consuming, opt, recognize},
        sequence::{preceded, tuple},
    };
    use tracing::warn;

    /// Drawers found at the top of a description, and the text after them.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct DrawerScan {
        pub properties: Option<PropertyDrawer>,
        pub logbook: Option<Logbook>,
        pub rest: String,
        pub warnings: Vec<ParseWarning>,
    }

    struct Block<'a> {
        line: usize,
        indent: &'a str,
        /// Body lines with their document line numbers, terminators stripped.
        lines: Vec<(usize, &'a str)>,
        /// Bytes used, `:END:` line included.
        consumed: usize,
    }

    /// Scans `text` (whose first line is document line `first_line`) for a properties
    /// drawer followed by a logbook drawer.
    pub fn parse_drawers(text: &str, first_line: usize) -> DrawerScan {
        let mut scan = DrawerScan::default();
        let mut offset = 0;
        let mut line = first_line;

        match read_block(text, first_line, "PROPERTIES") {
            Some(Ok(block)) => match properties_from(&block) {
                Ok(drawer) => {
                    scan.properties = Some(drawer);
                    offset = block.consumed;
                    line += block.lines.len() + 2;
                }
                Err(defect) => {
                    scan.warnings.push(malformed(block.line, "PROPERTIES", defect));
                    scan.rest = text.to_string();
                    return scan;
                }
            },
            Some(Err(defect)) => {
                scan.warnings.push(malformed(first_line, "PROPERTIES", defect));
                scan.rest = text.to_string();
                return scan;
            }
            None => {}
        }

        let remaining = &text[offset..];
        match read_block(remaining, line, "LOGBOOK") {
            Some(Ok(block)) => {
                scan.logbook = Some(logbook_from(&block, &mut scan.warnings));
                offset += block.consumed;
            }
            Some(Err(defect)) => scan.warnings.push(malformed(line, "LOGBOOK", defect)),
            None => {}
        }

        scan.rest = text[offset..].to_string();
        scan
    }

    fn malformed(line: usize, drawer: &str, defect: DrawerDefect) -> ParseWarning {
        let warning = ParseWarning::MalformedDrawer {
            line,
            drawer: drawer.to_string(),
            defect,
        };
        warn!(%warning, "drawer left as text");
        warning
    }

    fn strip_eol(line: &str) -> &str {
        line.strip_suffix('\n').unwrap_or(line)
    }

    /// `None` when `text` does not open drawer `name` on its first line.
    fn read_block<'a>(
        text: &'a str,
        first_line: usize,
        name: &str,
    ) -> Option<Result<Block<'a>, DrawerDefect>> {
        let mut lines = text.split_inclusive('\n');
        let opener = lines.next()?;
        let LineKind::DrawerOpen { indent, name: found } = classify(strip_eol(opener)) else {
            return None;
        };
        if found != name {
            return None;
        }

        let mut block = Block {
            line: first_line,
            indent,
            lines: Vec::new(),
            consumed: opener.len(),
        };
        for (n, raw) in lines.enumerate() {
            let body = strip_eol(raw);
            block.consumed += raw.len();
            match classify(body) {
                LineKind::DrawerEnd { indent: end } if end == indent => return Some(Ok(block)),
                _ => block.lines.push((first_line + n + 1, body)),
            }
        }
        Some(Err(DrawerDefect::Unterminated))
    }

    fn properties_from(block: &Block<'_>) -> Result<PropertyDrawer, DrawerDefect> {
        let mut properties = IndexMap::new();
        for &(line, text) in &block.lines {
            let (key, separator, value) = match classify(text) {
                LineKind::Property {
                    indent,
                    key,
                    separator,
                    value,
                } if indent == block.indent => (key, separator, value),
                LineKind::DrawerOpen { indent, name } if indent == block.indent => (name, "", ""),
                _ => return Err(DrawerDefect::UnexpectedLine { line }),
            };
            let slot = key.to_uppercase();
            if properties.contains_key(&slot) {
                return Err(DrawerDefect::DuplicateKey(key.to_string()));
            }
            properties.insert(
                slot,
                Property {
                    key: key.to_string(),
                    separator: separator.to_string(),
                    value: value.to_string(),
                },
            );
        }
        Ok(PropertyDrawer {
            indent: block.indent.to_string(),
            properties,
        })
    }

    fn logbook_from(block: &Block<'_>, warnings: &mut Vec<ParseWarning>) -> Logbook {
        let mut entries = Vec::with_capacity(block.lines.len());
        for &(line, text) in &block.lines {
            let Some(clock) = parse_clock_line(text) else {
                entries.push(LogbookEntry::Note(text.to_string()));
                continue;
            };
            if let (Some(recorded), Some(derived)) = (clock.recorded_minutes(), clock.minutes()) {
                if recorded != derived {
                    let warning = ParseWarning::ClockDurationMismatch {
                        line,
                        recorded: format_minutes(recorded),
                        derived: format_minutes(derived),
                    };
                    warn!(%warning, "keeping recorded clock duration");
                    warnings.push(warning);
                }
            }
            entries.push(LogbookEntry::Clock(clock));
        }
        Logbook {
            indent: block.indent.to_string(),
            entries,
        }
    }

    /// `CLOCK: [start]` or `CLOCK: [start]--[end] =>  H:MM`.
    pub fn parse_clock_line(line: &str) -> Option<ClockEntry> {
        let (indent, body) = split_indent(line);
        let (_, (start, closed)) = all_consuming(clock_body)(body).ok()?;
        let (end, duration) = match closed {
            Some((end, duration)) => (Some(end), duration.map(str::to_string)),
            None => (None, None),
        };
        Some(ClockEntry {
            indent: indent.to_string(),
            start,
            end,
            duration,
        })
    }

    #[allow(clippy::type_complexity)]
    fn clock_body(i: &str) -> PResult<'_, (Timestamp, Option<(Timestamp, Option<&str>)>)> {
        preceded(
            tag("CLOCK: "),
            tuple((
                parse_timestamp,
                opt(preceded(
                    tag("--"),
                    tuple((parse_timestamp, opt(preceded(tag(" =>"), clock_duration)))),
                )),
            )),
        )(i)
    }

    fn clock_duration(i: &str) -> PResult<'_, &str> {
        recognize(tuple((
            space1,
            opt(char('-')),
            digit1,
            char(':'),
            take_while_m_n(2, 2, |c: char| c.is_ascii_digit()),
        )))(i)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        const DRAWERS: &str = "\
:PROPERTIES:
:CUSTOM_ID: intro
:Effort:   1:00
:ARCHIVE:
:END:
:LOGBOOK:
- State \"DONE\"       from \"TODO\"       [2019-07-30 Tue 10:05]
CLOCK: [2019-07-30 Tue 09:00]--[2019-07-30 Tue 10:30] =>  1:30
CLOCK: [2019-07-31 Wed 09:00]
:END:
Body text.
";

        #[test]
        fn parses_properties_then_logbook() {
            let scan = parse_drawers(DRAWERS, 2);
            assert!(scan.warnings.is_empty());
            assert_eq!(scan.rest, "Body text.\n");

            let props = scan.properties.unwrap();
            assert_eq!(props.len(), 3);
            assert_eq!(props.get("effort"), Some("1:00"));
            assert_eq!(props.properties["EFFORT"].key, "Effort");
            assert_eq!(props.properties["EFFORT"].separator, "   ");
            assert_eq!(props.get("archive"), Some(""));

            let logbook = scan.logbook.unwrap();
            assert_eq!(logbook.entries.len(), 3);
            assert!(matches!(logbook.entries[0], LogbookEntry::Note(_)));
            let clocks: Vec<_> = logbook.clocks().collect();
            assert_eq!(clocks[0].duration.as_deref(), Some("  1:30"));
            assert_eq!(clocks[0].minutes(), Some(90));
            assert!(clocks[1].end.is_none());
            assert_eq!(logbook.total_minutes(), 90);
        }

        #[test]
        fn unterminated_drawer_is_kept_as_text() {
            let text = ":PROPERTIES:\n:ID: 1\nno end here\n";
            let scan = parse_drawers(text, 5);
            assert!(scan.properties.is_none());
            assert_eq!(scan.rest, text);
            assert_eq!(
                scan.warnings,
                vec![ParseWarning::MalformedDrawer {
                    line: 5,
                    drawer: "PROPERTIES".into(),
                    defect: DrawerDefect::Unterminated,
                }]
            );
        }

        #[test]
        fn mismatched_end_indent_does_not_close() {
            let text = "  :LOGBOOK:\n  CLOCK: [2019-07-30 Tue 09:00]\n:END:\n";
            let scan = parse_drawers(text, 1);
            assert!(scan.logbook.is_none());
            assert_eq!(scan.rest, text);
            assert!(matches!(
                scan.warnings[0],
                ParseWarning::MalformedDrawer {
                    defect: DrawerDefect::Unterminated,
                    ..
                }
            ));
        }

        #[test]
        fn stray_line_inside_properties_is_reported() {
            let text = ":PROPERTIES:\n:ID: 1\nnot a property\n:END:\nrest\n";
            let scan = parse_drawers(text, 5);
            assert!(scan.properties.is_none());
            assert_eq!(scan.rest, text);
            assert!(matches!(
                scan.warnings[0],
                ParseWarning::MalformedDrawer {
                    line: 5,
                    defect: DrawerDefect::UnexpectedLine { line: 7 },
                    ..
                }
            ));
        }

        #[test]
        fn duplicate_keys_reject_the_drawer() {
            let text = ":PROPERTIES:\n:ID: 1\n:id: 2\n:END:\n";
            let scan = parse_drawers(text, 1);
            assert!(scan.properties.is_none());
            assert_eq!(scan.rest, text);
            assert!(matches!(
                &scan.warnings[0],
                ParseWarning::MalformedDrawer {
                    defect: DrawerDefect::DuplicateKey(key),
                    ..
                } if key == "id"
            ));
        }

        #[test]
        fn wrong_clock_duration_is_kept_with_a_warning() {
            let text = ":LOGBOOK:\nCLOCK: [2019-07-30 Tue 09:00]--[2019-07-30 Tue 10:30] =>  2:00\n:END:\n";
            let scan = parse_drawers(text, 3);
            let logbook = scan.logbook.unwrap();
            let clock = logbook.clocks().next().unwrap();
            assert_eq!(clock.duration.as_deref(), Some("  2:00"));
            assert_eq!(
                scan.warnings,
                vec![ParseWarning::ClockDurationMismatch {
                    line: 4,
                    recorded: "2:00".into(),
                    derived: "1:30".into(),
                }]
            );
        }

        #[test]
        fn oversized_clock_duration_is_kept_without_a_verdict() {
            let text = ":LOGBOOK:\nCLOCK: [2019-07-30 Tue 09:00]--[2019-07-30 Tue 10:00] =>  922337203685477580:00\n:END:\n";
            let scan = parse_drawers(text, 3);
            let logbook = scan.logbook.unwrap();
            let clock = logbook.clocks().next().unwrap();
            assert_eq!(clock.recorded_minutes(), None);
            assert_eq!(clock.duration.as_deref(), Some("  922337203685477580:00"));
            assert!(scan.warnings.is_empty());

            let doc = crate::parse(&format!("* A\n{text}"));
            assert_eq!(crate::export(&doc), format!("* A\n{text}"));
        }

        #[test]
        fn logbook_before_properties_is_not_a_drawer_pair() {
            let text = ":LOGBOOK:\n:END:\n:PROPERTIES:\n:END:\n";
            let scan = parse_drawers(text, 1);
            assert!(scan.logbook.is_some());
            assert!(scan.properties.is_none());
            assert_eq!(scan.rest, ":PROPERTIES:\n:END:\n");
        }
    }
}

pub mod parser {
    //! Tree builder: classifies every line, groups bodies under their headlines and
    //! nests headings by star count.

    use super::classify::{LineKind, classify, is_blank};
    use super::core::*;
    use super::drawer::parse_drawers;
    use super::planning::{PlanningExtraction, parse_planning_items};
    use indexmap::IndexSet;
    use tracing::debug;

    /// Parses with the built-in `TODO | DONE` keywords and `A`..`C` priorities.
    pub fn parse(text: &str) -> Document {
        parse_with_config(text, &ParseConfig::default())
    }

    /// Parses `text`. Never fails: anything not recognized stays as description text.
    pub fn parse_with_config(text: &str, config: &ParseConfig) -> Document {
        let mut doc = Document::default();
        doc.final_newline = text.is_empty() || text.ends_with('\n');
        doc.settings.priorities = config.priorities;

        let mut declared = Vec::new();
        let mut raw_headings: Vec<RawHeading<'_>> = Vec::new();
        for (n, raw_line) in text.split_inclusive('\n').enumerate() {
            let line = raw_line.strip_suffix('\n').unwrap_or(raw_line);
            match classify(line) {
                LineKind::Heading { level, rest } => raw_headings.push(RawHeading {
                    line: n + 1,
                    level,
                    rest,
                    body: String::new(),
                }),
                kind => match raw_headings.last_mut() {
                    Some(current) => current.body.push_str(raw_line),
                    None => {
                        if let LineKind::FileConfig { key, value } = kind {
                            doc.file_config_lines.push(line.to_string());
                            apply_file_config(&mut doc.settings, &mut declared, key, value);
                        }
                        doc.lines_before_headings.push_str(raw_line);
                    }
                },
            }
        }

        doc.todo_keyword_sets = if declared.is_empty() {
            vec![config.default_keywords.clone()]
        } else {
            declared
        };

        let mut stack: Vec<Heading> = Vec::new();
        for (n, raw) in raw_headings.into_iter().enumerate() {
            let heading = build_heading(
                HeadingId(n),
                raw,
                &doc.todo_keyword_sets,
                &doc.settings.priorities,
                &mut doc.warnings,
            );
            while stack.last().is_some_and(|top| top.level >= heading.level) {
                close_top(&mut stack, &mut doc.headings);
            }
            stack.push(heading);
        }
        while !stack.is_empty() {
            close_top(&mut stack, &mut doc.headings);
        }

        doc.reindex();
        debug!(
            headings = doc.heading_count(),
            warnings = doc.warnings.len(),
            "parsed document"
        );
        doc
    }

    struct RawHeading<'a> {
        line: usize,
        level: usize,
        rest: &'a str,
        body: String,
    }

    fn close_top(stack: &mut Vec<Heading>, roots: &mut Vec<Heading>) {
        if let Some(completed) = stack.pop() {
            match stack.last_mut() {
                Some(parent) => parent.children.push(completed),
                None => roots.push(completed),
            }
        }
    }

    fn build_heading(
        id: HeadingId,
        raw: RawHeading<'_>,
        keyword_sets: &[TodoKeywordSet],
        priorities: &PriorityRange,
        warnings: &mut Vec<ParseWarning>,
    ) -> Heading {
        let parts = split_headline(raw.rest, keyword_sets, priorities);
        let mut heading = Heading::new(id, raw.level, RichText::parse(parts.title));
        heading.keyword = parts.keyword;
        heading.priority = parts.priority;
        heading.tags = parts.tags;
        heading.tag_gap = parts.tag_gap.to_string();
        heading.trailing_whitespace = parts.trailing.to_string();

        let PlanningExtraction {
            planning,
            stripped_description,
        } = parse_planning_items(&raw.body);
        let drawer_line = raw.line + 1 + usize::from(planning.is_some());
        let scan = parse_drawers(&stripped_description, drawer_line);

        heading.planning = planning;
        heading.properties = scan.properties;
        heading.logbook = scan.logbook;
        heading.description = RichText::parse(&scan.rest);
        warnings.extend(scan.warnings);
        heading
    }

    /// A headline split into its parts. Exporting the parts in order rebuilds it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct HeadlineParts<'a> {
        pub keyword: Option<TodoKeyword>,
        pub priority: Option<Priority>,
        pub title: &'a str,
        pub tags: IndexSet<String>,
        pub tag_gap: &'a str,
        pub trailing: &'a str,
    }

    /// Splits the text after the stars: `KEYWORD [#P] title   :tag1:tag2:`.
    pub fn split_headline<'a>(
        rest: &'a str,
        keyword_sets: &[TodoKeywordSet],
        priorities: &PriorityRange,
    ) -> HeadlineParts<'a> {
        let core = rest.trim_end_matches(is_blank);
        let trailing = &rest[core.len()..];
        let mut remaining = core;

        let keyword = core
            .split(' ')
            .next()
            .and_then(|word| lookup_keyword(keyword_sets, word));
        if let Some(kw) = &keyword {
            remaining = &core[kw.text.len()..];
        }

        let probe = if keyword.is_some() {
            remaining.strip_prefix(' ')
        } else {
            Some(remaining)
        };
        let priority = probe.and_then(|p| split_priority(p, priorities));
        if let Some((_, tail)) = priority {
            remaining = tail;
        }

        let (title_part, tag_gap, tags) =
            split_tags(remaining).unwrap_or_else(|| (remaining, "", IndexSet::new()));
        let title = if keyword.is_some() || priority.is_some() {
            title_part.strip_prefix(' ').unwrap_or(title_part)
        } else {
            title_part
        };

        HeadlineParts {
            keyword,
            priority: priority.map(|(p, _)| p),
            title,
            tags,
            tag_gap,
            trailing,
        }
    }

    fn split_priority<'a>(text: &'a str, priorities: &PriorityRange) -> Option<(Priority, &'a str)> {
        let after = text.strip_prefix("[#")?;
        let letter = after.chars().next()?;
        let tail = after[letter.len_utf8()..].strip_prefix(']')?;
        let bounded = tail.is_empty() || tail.starts_with(' ');
        (bounded && priorities.contains(letter)).then_some((Priority(letter), tail))
    }

    pub(crate) fn is_tag_char(c: char) -> bool {
        c.is_alphanumeric() || "_@#%".contains(c)
    }

    /// Splits a trailing `:a:b:` block off `text`, with the whitespace before it.
    fn split_tags(text: &str) -> Option<(&str, &str, IndexSet<String>)> {
        if !text.ends_with(':') {
            return None;
        }
        let start = text.rfind(is_blank).map_or(0, |pos| pos + 1);
        let inner = text[start..].strip_prefix(':')?.strip_suffix(':')?;

        let mut tags = IndexSet::new();
        for tag in inner.split(':') {
            if tag.is_empty() || !tag.chars().all(is_tag_char) || !tags.insert(tag.to_string()) {
                return None;
            }
        }

        let before = &text[..start];
        let title = before.trim_end_matches(is_blank);
        Some((title, &before[title.len()..], tags))
    }

    fn apply_file_config(
        settings: &mut FileSettings,
        declared: &mut Vec<TodoKeywordSet>,
        key: &str,
        value: &str,
    ) {
        match key.to_ascii_uppercase().as_str() {
            "TODO" | "SEQ_TODO" | "TYP_TODO" => match TodoKeywordSet::from_declaration(value) {
                Some(set) => declared.push(set),
                None => debug!(key, "empty keyword declaration ignored"),
            },
            "PRIORITIES" => {
                let letters: Vec<char> = value
                    .split_whitespace()
                    .filter_map(|w| {
                        let mut chars = w.chars();
                        match (chars.next(), chars.next()) {
                            (Some(c), None) if c.is_ascii_uppercase() => Some(c),
                            _ => None,
                        }
                    })
                    .collect();
                match letters[..] {
                    [highest, lowest, default]
                        if highest <= lowest && (highest..=lowest).contains(&default) =>
                    {
                        settings.priorities = PriorityRange {
                            highest,
                            lowest,
                            default,
                        };
                    }
                    _ => debug!(value, "unusable #+PRIORITIES line ignored"),
                }
            }
            "STARTUP" => settings
                .startup
                .extend(value.split_whitespace().map(str::to_string)),
            other => {
                settings
                    .meta
                    .insert(other.to_ascii_lowercase(), value.trim_end().to_string());
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn titles(headings: &[Heading]) -> Vec<String> {
            headings.iter().map(|h| h.title.raw.clone()).collect()
        }

        #[test]
        fn nests_headings_by_level() {
            let doc = parse("* A\n** B\n*** C\n** D\n* E\n*** F\n");
            assert_eq!(titles(&doc.headings), vec!["A", "E"]);
            assert_eq!(titles(&doc.headings[0].children), vec!["B", "D"]);
            assert_eq!(titles(&doc.headings[0].children[0].children), vec!["C"]);
            assert_eq!(titles(&doc.headings[1].children), vec!["F"]);

            let ids: Vec<usize> = doc.headings().map(|(_, h)| h.id.0).collect();
            assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
            assert_eq!(doc.outline()[2].parent, Some(HeadingIndex(1)));
            assert_eq!(doc.outline()[2].path, vec![0, 0, 0]);
        }

        #[test]
        fn splits_keyword_priority_title_and_tags() {
            let sets = ParseConfig::default();
            let parts = split_headline(
                "TODO [#A] Write *report*   :work:urgent: ",
                std::slice::from_ref(&sets.default_keywords),
                &sets.priorities,
            );
            assert_eq!(parts.keyword.as_ref().map(|k| k.text.as_str()), Some("TODO"));
            assert_eq!(parts.priority, Some(Priority('A')));
            assert_eq!(parts.title, "Write *report*");
            assert_eq!(parts.tag_gap, "   ");
            assert_eq!(
                parts.tags.iter().map(String::as_str).collect::<Vec<_>>(),
                vec!["work", "urgent"]
            );
            assert_eq!(parts.trailing, " ");
        }

        #[test]
        fn unknown_keywords_and_bad_cookies_stay_in_the_title() {
            let doc = parse("* WAITING [#Z] call back :a:a:\n");
            let heading = &doc.headings[0];
            assert!(heading.keyword.is_none());
            assert!(heading.priority.is_none());
            assert!(heading.tags.is_empty());
            assert_eq!(heading.title.raw, "WAITING [#Z] call back :a:a:");
        }

        #[test]
        fn file_keyword_sets_replace_the_default() {
            let text = "#+TITLE: Plan\n#+TODO: TODO(t) NEXT | DONE(d!) CANCELLED\n#+PRIORITIES: A E C\n\n* NEXT [#E] Ship\n* CANCELLED Old\n* DONE Finished\n";
            let doc = parse(text);
            assert_eq!(doc.file_config_lines.len(), 3);
            assert_eq!(doc.settings.meta.get("title").map(String::as_str), Some("Plan"));
            assert_eq!(doc.settings.priorities.lowest, 'E');
            assert_eq!(
                doc.todo_keyword_sets,
                vec![TodoKeywordSet {
                    active: vec!["TODO".into(), "NEXT".into()],
                    done: vec!["DONE".into(), "CANCELLED".into()],
                }]
            );
            assert_eq!(doc.lines_before_headings, "#+TITLE: Plan\n#+TODO: TODO(t) NEXT | DONE(d!) CANCELLED\n#+PRIORITIES: A E C\n\n");

            let next = &doc.headings[0];
            assert_eq!(next.keyword.as_ref().map(|k| k.is_done), Some(false));
            assert_eq!(next.priority, Some(Priority('E')));
            assert_eq!(doc.headings[1].keyword.as_ref().map(|k| k.is_done), Some(true));
            assert_eq!(doc.headings[2].keyword.as_ref().map(|k| k.text.as_str()), Some("DONE"));
        }

        #[test]
        fn keyword_declaration_without_bar_marks_last_as_done() {
            let doc = parse("#+SEQ_TODO: OPEN REVIEW CLOSED\n* CLOSED thing\n* REVIEW other\n");
            assert_eq!(doc.headings[0].keyword.as_ref().map(|k| k.is_done), Some(true));
            assert_eq!(doc.headings[1].keyword.as_ref().map(|k| k.is_done), Some(false));
        }

        #[test]
        fn config_lines_after_first_heading_are_body_text() {
            let doc = parse("* A\n#+STARTUP: nologrepeat\n");
            assert!(doc.settings.startup.is_empty());
            assert!(doc.file_config_lines.is_empty());
            assert_eq!(doc.headings[0].description.raw, "#+STARTUP: nologrepeat\n");
        }

        #[test]
        fn attaches_planning_drawers_and_description() {
            let text = "\
* TODO Task
  SCHEDULED: <2019-07-30 Tue> DEADLINE: <2019-08-01 Thu>
  :PROPERTIES:
  :ID:       abc
  :END:
  :LOGBOOK:
  CLOCK: [2019-07-29 Mon 09:00]--[2019-07-29 Mon 09:30] =>  0:30
  :END:

  Notes with a [[https://example.com][link]].
";
            let doc = parse(text);
            let task = &doc.headings[0];
            let planning = task.planning.as_ref().unwrap();
            assert_eq!(planning.indent, "  ");
            assert!(planning.deadline().is_some());
            assert_eq!(task.property("id"), Some("abc"));
            assert_eq!(task.logbook.as_ref().unwrap().total_minutes(), 30);
            assert_eq!(task.description.raw, "\n  Notes with a [[https://example.com][link]].\n");
            assert!(doc.warnings.is_empty());
        }

        #[test]
        fn malformed_drawer_warning_carries_document_line() {
            let doc = parse("intro\n* A\nSCHEDULED: <2019-07-30 Tue>\n:PROPERTIES:\n:ID: 1\n");
            assert!(doc.headings[0].properties.is_none());
            assert_eq!(doc.headings[0].description.raw, ":PROPERTIES:\n:ID: 1\n");
            assert!(matches!(
                doc.warnings[0],
                ParseWarning::MalformedDrawer { line: 4, .. }
            ));
        }

        #[test]
        fn records_missing_final_newline() {
            assert!(!parse("* A\nbody").final_newline);
            assert!(parse("* A\n").final_newline);
            assert!(parse("").final_newline);
        }

        #[test]
        fn stars_without_space_are_not_headings() {
            let doc = parse("*bold* start\n** Real\n");
            assert_eq!(doc.lines_before_headings, "*bold* start\n");
            assert_eq!(doc.headings[0].level, 2);
        }
    }
}

pub mod format {
    use super::core::*;
    use super::parser::is_tag_char;

    /// Renders a document back to org text.
    pub fn export(doc: &Document) -> String {
        let mut out = String::with_capacity(doc.lines_before_headings.len() + 64 * doc.heading_count());
        out.push_str(&doc.lines_before_headings);
        for heading in &doc.headings {
            write_heading(&mut out, heading);
        }
        if !doc.final_newline && out.ends_with('\n') {
            out.pop();
        }
        out
    }

    /// Like [`export`], but first verifies that the document can round-trip.
    pub fn export_checked(doc: &Document) -> Result<String, ExportError> {
        let mut order = Vec::new();
        collect(&doc.headings, 0, &mut order);
        let last = order.len().saturating_sub(1);
        for (pos, (heading, parent_level)) in order.into_iter().enumerate() {
            validate(doc, heading, parent_level, pos == last)?;
        }
        Ok(export(doc))
    }

    fn collect<'a>(headings: &'a [Heading], parent_level: usize, out: &mut Vec<(&'a Heading, usize)>) {
        for heading in headings {
            out.push((heading, parent_level));
            collect(&heading.children, heading.level, out);
        }
    }

    fn validate(
        doc: &Document,
        heading: &Heading,
        parent_level: usize,
        is_last: bool,
    ) -> Result<(), ExportError> {
        let id = heading.id;
        if heading.level == 0 {
            return Err(ExportError::InvalidLevel {
                heading: id,
                level: heading.level,
            });
        }
        if heading.level <= parent_level {
            return Err(ExportError::LevelJump {
                heading: id,
                level: heading.level,
                parent_level,
            });
        }
        if heading.title.raw.contains('\n') {
            return Err(ExportError::MultilineTitle { heading: id });
        }
        if let Some(tag) = heading
            .tags
            .iter()
            .find(|tag| tag.is_empty() || !tag.chars().all(is_tag_char))
        {
            return Err(ExportError::InvalidTag {
                heading: id,
                tag: tag.clone(),
            });
        }
        if let Some(keyword) = &heading.keyword {
            if !doc.todo_keyword_sets.iter().any(|set| set.contains(&keyword.text)) {
                return Err(ExportError::UnknownKeyword {
                    heading: id,
                    keyword: keyword.text.clone(),
                });
            }
        }
        if let Some(drawer) = &heading.properties {
            if let Some((slot, property)) = drawer
                .properties
                .iter()
                .find(|(slot, p)| **slot != p.key.to_uppercase())
            {
                return Err(ExportError::PropertyKeyMismatch {
                    heading: id,
                    key: property.key.clone(),
                    slot: slot.clone(),
                });
            }
        }
        if !heading.title.is_consistent() || !heading.description.is_consistent() {
            return Err(ExportError::SpanMismatch { heading: id });
        }
        if !is_last && !heading.description.is_empty() && !heading.description.raw.ends_with('\n') {
            return Err(ExportError::UnterminatedDescription { heading: id });
        }
        Ok(())
    }

    fn write_heading(out: &mut String, heading: &Heading) {
        out.push_str(&render_headline(heading));
        out.push('\n');
        if let Some(planning) = &heading.planning {
            out.push_str(&render_planning(planning));
            out.push('\n');
        }
        if let Some(drawer) = &heading.properties {
            out.push_str(&render_properties(drawer));
        }
        if let Some(logbook) = &heading.logbook {
            out.push_str(&render_logbook(logbook));
        }
        out.push_str(&heading.description.render());
        for child in &heading.children {
            write_heading(out, child);
        }
    }

    /// The headline without its terminator.
    pub fn render_headline(heading: &Heading) -> String {
        let mut line = "*".repeat(heading.level);
        line.push(' ');
        if let Some(keyword) = &heading.keyword {
            line.push_str(&keyword.text);
        }
        if let Some(Priority(letter)) = heading.priority {
            if heading.keyword.is_some() {
                line.push(' ');
            }
            line.push_str("[#");
            line.push(letter);
            line.push(']');
        }
        let title = heading.title.render();
        if !title.is_empty() {
            if heading.keyword.is_some() || heading.priority.is_some() {
                line.push(' ');
            }
            line.push_str(&title);
        }
        if !heading.tags.is_empty() {
            line.push_str(&heading.tag_gap);
            line.push(':');
            for tag in &heading.tags {
                line.push_str(tag);
                line.push(':');
            }
        }
        line.push_str(&heading.trailing_whitespace);
        line
    }

    /// Planning items in SCHEDULED, DEADLINE, CLOSED order.
    pub fn render_planning(planning: &Planning) -> String {
        let items: Vec<String> = planning
            .canonical_items()
            .into_iter()
            .map(|item| format!("{}: {}", item.kind.keyword(), item.timestamp))
            .collect();
        format!("{}{}", planning.indent, items.join(" "))
    }

    pub fn render_properties(drawer: &PropertyDrawer) -> String {
        let indent = &drawer.indent;
        let mut out = format!("{indent}:PROPERTIES:\n");
        for property in drawer.properties.values() {
            out.push_str(&format!(
                "{indent}:{}:{}{}\n",
                property.key, property.separator, property.value
            ));
        }
        out.push_str(&format!("{indent}:END:\n"));
        out
    }

    /// Entries are written in stored order, newest first for recorded entries.
    pub fn render_logbook(logbook: &Logbook) -> String {
        let indent = &logbook.indent;
        let mut out = format!("{indent}:LOGBOOK:\n");
        for entry in &logbook.entries {
            match entry {
                LogbookEntry::Clock(clock) => out.push_str(&render_clock(clock)),
                LogbookEntry::Note(note) => out.push_str(note),
            }
            out.push('\n');
        }
        out.push_str(&format!("{indent}:END:\n"));
        out
    }

    pub fn render_clock(clock: &ClockEntry) -> String {
        let mut line = format!("{}CLOCK: {}", clock.indent, clock.start);
        if let Some(end) = &clock.end {
            line.push_str(&format!("--{end}"));
            if let Some(duration) = &clock.duration {
                line.push_str(" =>");
                line.push_str(duration);
            }
        }
        line
    }

    impl ClockEntry {
        /// Closes a running clock and records its duration the way Emacs pads it.
        pub fn close(&mut self, end: Timestamp) {
            self.end = Some(end);
            self.duration = self
                .minutes()
                .map(|minutes| format!("{:>6}", format_minutes(minutes)));
        }
    }

}

pub mod query {
    //! Inherited per-heading flags.
    //!
    //! A flag is read from the heading's own properties, then from each ancestor
    //! outward; the nearest heading with a decisive value wins. Without one, the
    //! `#+STARTUP:` tokens decide, and the default is off.

    use super::core::*;
    use std::str::FromStr;
    use tracing::debug;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum InheritedFlag {
        /// Suppress log entries when a repeating task is marked done.
        NoLogRepeat,
        /// Record a CLOSED timestamp when a task is marked done.
        LogDone,
        /// Put state-change notes into the `:LOGBOOK:` drawer.
        LogIntoDrawer,
    }

    impl FromStr for InheritedFlag {
        type Err = QueryError;

        /// Case-insensitive; dashes and underscores are ignored.
        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let normalized: String = s
                .chars()
                .filter(|c| *c != '-' && *c != '_')
                .flat_map(char::to_lowercase)
                .collect();
            match normalized.as_str() {
                "nologrepeat" => Ok(InheritedFlag::NoLogRepeat),
                "logdone" => Ok(InheritedFlag::LogDone),
                "logintodrawer" => Ok(InheritedFlag::LogIntoDrawer),
                _ => Err(QueryError::UnknownFlag(s.to_string())),
            }
        }
    }

    impl InheritedFlag {
        /// `#+STARTUP:` tokens that switch the flag on and off.
        fn startup_tokens(self) -> (&'static str, &'static str) {
            match self {
                InheritedFlag::NoLogRepeat => ("nologrepeat", "logrepeat"),
                InheritedFlag::LogDone => ("logdone", "nologdone"),
                InheritedFlag::LogIntoDrawer => ("logdrawer", "nologdrawer"),
            }
        }

        /// Value set directly on `heading`, if it decides the flag.
        pub fn property_value(self, heading: &Heading) -> Option<bool> {
            match self {
                InheritedFlag::NoLogRepeat | InheritedFlag::LogDone => {
                    let logging = heading.property("LOGGING")?;
                    let (on, off) = self.startup_tokens();
                    let mut decided = None;
                    for token in logging.split_whitespace() {
                        if token.eq_ignore_ascii_case("nil") {
                            decided = Some(self == InheritedFlag::NoLogRepeat);
                        } else if token.eq_ignore_ascii_case(on) {
                            decided = Some(true);
                        } else if token.eq_ignore_ascii_case(off) {
                            decided = Some(false);
                        }
                    }
                    decided
                }
                InheritedFlag::LogIntoDrawer => {
                    let value = heading.property("LOG_INTO_DRAWER")?.trim();
                    if value.is_empty() {
                        None
                    } else {
                        Some(!value.eq_ignore_ascii_case("nil"))
                    }
                }
            }
        }

        /// File-wide value; later tokens override earlier ones.
        pub fn startup_value(self, startup: &[String]) -> Option<bool> {
            let (on, off) = self.startup_tokens();
            startup.iter().rev().find_map(|token| {
                if token.eq_ignore_ascii_case(on) {
                    Some(true)
                } else if token.eq_ignore_ascii_case(off) {
                    Some(false)
                } else {
                    None
                }
            })
        }

        /// Resolves the flag for the heading at pre-order position `index`.
        pub fn resolve(self, doc: &Document, index: HeadingIndex) -> Result<bool, QueryError> {
            let ancestors = doc.ancestors(index)?;
            for candidate in std::iter::once(index).chain(ancestors) {
                let Some(heading) = doc.heading(candidate) else {
                    continue;
                };
                if let Some(value) = self.property_value(heading) {
                    debug!(flag = ?self, index = index.0, from = candidate.0, value, "flag set by property");
                    return Ok(value);
                }
            }
            Ok(self.startup_value(&doc.settings.startup).unwrap_or(false))
        }
    }

    /// Looks up `flag_name` (e.g. `"nologrepeat"`) for the heading at pre-order
    /// position `heading_index`.
    pub fn query_inherited_flag(
        doc: &Document,
        heading_index: usize,
        flag_name: &str,
    ) -> Result<bool, QueryError> {
        let flag: InheritedFlag = flag_name.parse()?;
        flag.resolve(doc, HeadingIndex(heading_index))
    }

}
