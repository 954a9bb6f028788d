//! The view of one failure handed to a [`ReportHandler`](crate::ReportHandler).
//!
//! A [`Report`] borrows everything it shows: the message and id live in the
//! runtime's scratch buffers, attributes in the live attribute store and
//! breadcrumbs in the ring, resolved through a snapshot of its slots. None of
//! it may outlive the handler call. Use [`Report::snapshot`] to keep an owned
//! copy.

use core::fmt;

use forensics_internals::{
    AttributeArena, BreadcrumbRef, BreadcrumbRing, BreadcrumbSlot, arena::AttributeIter,
};

use crate::backtrace::FrameAddress;

/// Where a failure was raised.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallSite<'a> {
    /// Source file, as given by `file!()`.
    pub file: &'a str,
    /// Source line.
    pub line: u32,
    /// Path of the enclosing function.
    pub function: &'a str,
}

impl<'a> CallSite<'a> {
    /// A call site with no location, used for signals.
    pub const UNKNOWN: CallSite<'static> = CallSite {
        file: "",
        line: 0,
        function: "",
    };

    /// Creates a call site.
    pub const fn new(file: &'a str, line: u32, function: &'a str) -> Self {
        Self {
            file,
            line,
            function,
        }
    }
}

/// One assembled failure report.
pub struct Report<'a> {
    pub(crate) id: &'a str,
    pub(crate) site: CallSite<'a>,
    pub(crate) expression: &'a str,
    pub(crate) format: &'a str,
    pub(crate) formatted: &'a str,
    pub(crate) fatal: bool,
    pub(crate) contexts: &'a [&'static str],
    pub(crate) attributes: Attributes<'a>,
    pub(crate) breadcrumbs: Breadcrumbs<'a>,
    pub(crate) backtrace: &'a [FrameAddress],
}

impl<'a> Report<'a> {
    /// The aggregation id: `{context}-{file basename}-{function}-{format}`.
    ///
    /// It depends on nothing else, so reports raised by the same assertion in
    /// the same context share an id.
    pub fn id(&self) -> &'a str {
        self.id
    }

    /// The call site.
    pub fn site(&self) -> CallSite<'a> {
        self.site
    }

    /// The source file.
    pub fn file(&self) -> &'a str {
        self.site.file
    }

    /// The source line.
    pub fn line(&self) -> u32 {
        self.site.line
    }

    /// The enclosing function.
    pub fn function(&self) -> &'a str {
        self.site.function
    }

    /// The text of the failed condition.
    pub fn expression(&self) -> &'a str {
        self.expression
    }

    /// The unformatted message.
    pub fn format(&self) -> &'a str {
        self.format
    }

    /// The formatted message, truncated to the configured size.
    pub fn formatted(&self) -> &'a str {
        self.formatted
    }

    /// Whether the failure is fatal.
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// The failing thread's contexts, outermost first.
    pub fn contexts(&self) -> &'a [&'static str] {
        self.contexts
    }

    /// The innermost context, if any.
    pub fn context(&self) -> Option<&'static str> {
        self.contexts.last().copied()
    }

    /// The attributes, in insertion order.
    pub fn attributes(&self) -> Attributes<'a> {
        self.attributes
    }

    /// The breadcrumbs, oldest first.
    pub fn breadcrumbs(&self) -> Breadcrumbs<'a> {
        self.breadcrumbs
    }

    /// The captured return addresses, innermost first.
    pub fn backtrace(&self) -> &'a [FrameAddress] {
        self.backtrace
    }

    /// Copies the report into owned storage.
    pub fn snapshot(&self) -> ReportSnapshot {
        ReportSnapshot {
            id: self.id.to_owned(),
            file: self.site.file.to_owned(),
            line: self.site.line,
            function: self.site.function.to_owned(),
            expression: self.expression.to_owned(),
            format: self.format.to_owned(),
            formatted: self.formatted.to_owned(),
            fatal: self.fatal,
            contexts: self.contexts.iter().map(|name| (*name).to_owned()).collect(),
            attributes: self
                .attributes
                .iter()
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .collect(),
            breadcrumbs: self
                .breadcrumbs
                .iter()
                .map(|crumb| BreadcrumbSnapshot {
                    name: crumb.name().to_owned(),
                    metadata: crumb
                        .metadata()
                        .map(|(key, value)| (key.to_owned(), value.to_owned()))
                        .collect(),
                    count: crumb.count(),
                })
                .collect(),
            backtrace: self.backtrace.to_vec(),
        }
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ASSERTION FAILED")?;
        writeln!(f, "expression: {}", self.expression)?;
        writeln!(f, "message: {}", self.formatted)?;
        writeln!(f, "context: {}", self.context().unwrap_or(NO_CONTEXT))?;
        writeln!(f, "file: {}", self.site.file)?;
        writeln!(f, "line: {}", self.site.line)?;
        writeln!(f, "function: {}", self.site.function)?;
        writeln!(f, "id: {}", self.id)?;
        writeln!(f, "fatal: {}", self.fatal)?;
        if !self.attributes.is_empty() {
            writeln!(f, "attributes:")?;
            for (key, value) in self.attributes.iter() {
                writeln!(f, "  {key}: {value}")?;
            }
        }
        if !self.breadcrumbs.is_empty() {
            writeln!(f, "breadcrumbs:")?;
            for crumb in self.breadcrumbs.iter() {
                write!(f, "  {}", crumb.name())?;
                if crumb.count() > 1 {
                    write!(f, " (x{})", crumb.count())?;
                }
                for (key, value) in crumb.metadata() {
                    write!(f, " {key}={value}")?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "backtrace:")?;
        for frame in self.backtrace {
            writeln!(f, "  {frame}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Report")
            .field("id", &self.id)
            .field("site", &self.site)
            .field("expression", &self.expression)
            .field("formatted", &self.formatted)
            .field("fatal", &self.fatal)
            .field("contexts", &self.contexts)
            .field("attributes", &self.attributes)
            .field("breadcrumbs", &self.breadcrumbs)
            .field("backtrace", &self.backtrace)
            .finish()
    }
}

/// Context name shown when the context stack is empty.
pub(crate) const NO_CONTEXT: &str = "<none>";

/// The attributes section of a [`Report`].
#[derive(Copy, Clone)]
pub struct Attributes<'a> {
    arena: Option<&'a AttributeArena>,
}

impl<'a> Attributes<'a> {
    pub(crate) const EMPTY: Self = Self { arena: None };

    pub(crate) fn new(arena: &'a AttributeArena) -> Self {
        Self { arena: Some(arena) }
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.arena.map_or(0, AttributeArena::len)
    }

    /// Returns `true` if there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up an attribute.
    pub fn get(&self, key: &str) -> Option<&'a str> {
        self.arena?.get(key)
    }

    /// Iterates over the attributes in insertion order.
    pub fn iter(&self) -> AttributesIter<'a> {
        AttributesIter(self.arena.map(AttributeArena::iter))
    }
}

/// Iterator over the attributes of a [`Report`].
#[derive(Clone)]
pub struct AttributesIter<'a>(Option<AttributeIter<'a>>);

impl<'a> Iterator for AttributesIter<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        self.0.as_mut()?.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.0
            .as_ref()
            .map_or((0, Some(0)), |inner| inner.size_hint())
    }
}

impl ExactSizeIterator for AttributesIter<'_> {}

impl fmt::Debug for Attributes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// The breadcrumbs section of a [`Report`].
#[derive(Copy, Clone)]
pub struct Breadcrumbs<'a> {
    ring: Option<&'a BreadcrumbRing>,
    slots: &'a [BreadcrumbSlot],
}

impl<'a> Breadcrumbs<'a> {
    pub(crate) const EMPTY: Self = Self {
        ring: None,
        slots: &[],
    };

    pub(crate) fn new(ring: &'a BreadcrumbRing, slots: &'a [BreadcrumbSlot]) -> Self {
        Self {
            ring: Some(ring),
            slots,
        }
    }

    /// Returns the number of breadcrumbs.
    pub fn len(&self) -> usize {
        if self.ring.is_some() { self.slots.len() } else { 0 }
    }

    /// Returns `true` if there are no breadcrumbs.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the breadcrumb at `index`, counting from the oldest.
    pub fn get(&self, index: usize) -> Option<BreadcrumbRef<'a>> {
        let ring = self.ring?;
        self.slots.get(index).map(|slot| ring.resolve(slot))
    }

    /// Iterates over the breadcrumbs, oldest first.
    pub fn iter(&self) -> BreadcrumbsIter<'a> {
        BreadcrumbsIter {
            ring: self.ring,
            slots: self.slots.iter(),
        }
    }
}

/// Iterator over the breadcrumbs of a [`Report`].
#[derive(Clone)]
pub struct BreadcrumbsIter<'a> {
    ring: Option<&'a BreadcrumbRing>,
    slots: core::slice::Iter<'a, BreadcrumbSlot>,
}

impl<'a> Iterator for BreadcrumbsIter<'a> {
    type Item = BreadcrumbRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let ring = self.ring?;
        self.slots.next().map(|slot| ring.resolve(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.ring {
            Some(_) => self.slots.size_hint(),
            None => (0, Some(0)),
        }
    }
}

impl ExactSizeIterator for BreadcrumbsIter<'_> {}

impl fmt::Debug for Breadcrumbs<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// An owned copy of a [`Report`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportSnapshot {
    /// See [`Report::id`].
    pub id: String,
    /// See [`Report::file`].
    pub file: String,
    /// See [`Report::line`].
    pub line: u32,
    /// See [`Report::function`].
    pub function: String,
    /// See [`Report::expression`].
    pub expression: String,
    /// See [`Report::format`].
    pub format: String,
    /// See [`Report::formatted`].
    pub formatted: String,
    /// See [`Report::is_fatal`].
    pub fatal: bool,
    /// See [`Report::contexts`].
    pub contexts: Vec<String>,
    /// See [`Report::attributes`].
    pub attributes: Vec<(String, String)>,
    /// See [`Report::breadcrumbs`].
    pub breadcrumbs: Vec<BreadcrumbSnapshot>,
    /// See [`Report::backtrace`].
    pub backtrace: Vec<FrameAddress>,
}

impl ReportSnapshot {
    /// Looks up an attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// An owned copy of one breadcrumb.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreadcrumbSnapshot {
    /// The breadcrumb's name.
    pub name: String,
    /// Its metadata pairs, in order.
    pub metadata: Vec<(String, String)>,
    /// How many times in a row it was added.
    pub count: usize,
}
