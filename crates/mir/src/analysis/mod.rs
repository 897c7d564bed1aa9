//! Analyses over Tern MIR.

pub mod partition;
mod sendck;
mod trace;

use common::diagnostics::{
    CompleteDiagnostic, DiagnosticPass, GlobalErrorCode, LabelStyle, Severity, SubDiagnostic,
};

use crate::ir::{Function, InstId, Module};

use sendck::Sendck;

/// Feature switches for the MIR analyses, as resolved by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisConfig {
    /// Run region-based send checking on MIR instead of rejecting sends
    /// during type checking.
    pub deferred_send_checking: bool,
}

/// A send-checking finding, in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SendDiagnostic {
    /// A value is sent across an isolation boundary here, and `shown` +
    /// `hidden` later accesses observe its region.
    ConsumptionYieldsRace {
        site: InstId,
        shown: usize,
        hidden: usize,
    },
    /// One access to a region that was sent away (at most a fixed number is
    /// reported per send).
    PossibleRacyAccessSite { site: InstId },
    /// The region containing the function's arguments is sent away, which
    /// the caller can never account for.
    ArgRegionConsumed { site: InstId },
}

impl SendDiagnostic {
    pub fn site(&self) -> InstId {
        match *self {
            Self::ConsumptionYieldsRace { site, .. }
            | Self::PossibleRacyAccessSite { site }
            | Self::ArgRegionConsumed { site } => site,
        }
    }

    /// Render to the driver's diagnostics format.
    pub fn render(&self, func: &Function) -> CompleteDiagnostic {
        let span = func.span_of(self.site());
        match *self {
            Self::ConsumptionYieldsRace { shown, hidden, .. } => {
                let plural = if shown == 1 { "" } else { "s" };
                let suffix = if hidden > 0 {
                    format!(", {hidden} more hidden")
                } else {
                    String::new()
                };
                CompleteDiagnostic::new(
                    Severity::Error,
                    "sending this value to another isolation domain risks a data race".to_string(),
                    vec![SubDiagnostic::new(
                        LabelStyle::Primary,
                        "value is sent across an isolation boundary here".to_string(),
                        span,
                    )],
                    vec![format!("{shown} access site{plural} shown{suffix}")],
                    GlobalErrorCode::new(DiagnosticPass::SendCheck, 1),
                )
            }
            Self::PossibleRacyAccessSite { .. } => CompleteDiagnostic::new(
                Severity::Note,
                "access could race with code on the other isolation domain".to_string(),
                vec![SubDiagnostic::new(
                    LabelStyle::Primary,
                    "the value's region was sent away before this access".to_string(),
                    span,
                )],
                vec![],
                GlobalErrorCode::new(DiagnosticPass::SendCheck, 2),
            ),
            Self::ArgRegionConsumed { .. } => CompleteDiagnostic::new(
                Severity::Error,
                "sending a region that contains a function argument is not allowed".to_string(),
                vec![SubDiagnostic::new(
                    LabelStyle::Primary,
                    "argument's region is sent across an isolation boundary here".to_string(),
                    span,
                )],
                vec!["the caller keeps using the argument after this call returns".to_string()],
                GlobalErrorCode::new(DiagnosticPass::SendCheck, 3),
            ),
        }
    }
}

/// Run region-based send checking on one function.
///
/// A no-op unless deferred send checking is enabled and the `Sendable`
/// protocol is available; without the protocol every type would have to be
/// conservatively treated as non-sendable, which is both wrong and
/// expensive. Purely observational: the IR is never modified.
pub fn check_function(
    module: &Module,
    func: &Function,
    config: &AnalysisConfig,
) -> Vec<SendDiagnostic> {
    if !config.deferred_send_checking {
        return Vec::new();
    }
    if !module.sendable_protocol_available {
        return Vec::new();
    }

    let mut analysis = Sendck::new(module, func);
    analysis.solve();
    analysis.diagnose()
}
