//! Diagnostics primitives shared by all compiler passes.
//!
//! Passes construct [`CompleteDiagnostic`] values; the driver decides how to
//! render them. Nothing here performs I/O.

use std::fmt;

use smol_str::SmolStr;

/// Half-open byte range into a named source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Span {
    pub file: SmolStr,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(file: impl Into<SmolStr>, start: u32, end: u32) -> Self {
        Self {
            file: file.into(),
            start,
            end,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}..{}", self.file, self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

/// How a [`SubDiagnostic`] label relates to the main message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LabelStyle {
    Primary,
    Secondary,
}

/// A labeled location attached to a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDiagnostic {
    pub style: LabelStyle,
    pub message: String,
    pub span: Option<Span>,
}

impl SubDiagnostic {
    pub fn new(style: LabelStyle, message: String, span: Option<Span>) -> Self {
        Self {
            style,
            message,
            span,
        }
    }
}

/// Pass namespace for error codes, so codes stay stable as passes evolve
/// independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiagnosticPass {
    Mir,
    SendCheck,
}

impl DiagnosticPass {
    fn prefix(self) -> &'static str {
        match self {
            Self::Mir => "MIR",
            Self::SendCheck => "SEND",
        }
    }
}

/// Globally unique diagnostic code, e.g. `SEND-0001`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GlobalErrorCode {
    pub pass: DiagnosticPass,
    pub local_code: u16,
}

impl GlobalErrorCode {
    pub fn new(pass: DiagnosticPass, local_code: u16) -> Self {
        Self { pass, local_code }
    }
}

impl fmt::Display for GlobalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}", self.pass.prefix(), self.local_code)
    }
}

/// A fully assembled diagnostic, ready for rendering by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteDiagnostic {
    pub severity: Severity,
    pub message: String,
    pub sub_diagnostics: Vec<SubDiagnostic>,
    pub notes: Vec<String>,
    pub error_code: GlobalErrorCode,
}

impl CompleteDiagnostic {
    pub fn new(
        severity: Severity,
        message: String,
        sub_diagnostics: Vec<SubDiagnostic>,
        notes: Vec<String>,
        error_code: GlobalErrorCode,
    ) -> Self {
        Self {
            severity,
            message,
            sub_diagnostics,
            notes,
            error_code,
        }
    }

    /// The span of the first primary label, if any.
    pub fn primary_span(&self) -> Option<&Span> {
        self.sub_diagnostics
            .iter()
            .find(|sub| sub.style == LabelStyle::Primary)
            .and_then(|sub| sub.span.as_ref())
    }
}
