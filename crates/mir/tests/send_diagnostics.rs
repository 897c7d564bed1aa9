//! End-to-end send-checking scenarios over small CFGs.

use common::diagnostics::Span;
use tern_mir::{
    AnalysisConfig, ApplyKind, CallIsolation, FunctionBuilder, InstId, Module, SendDiagnostic,
    SourceInfoId, TyData, TyId, TyKind, ValueRepr, check_function,
};

struct Tys {
    module: Module,
    data: TyId,
    fn_ty: TyId,
    bool_ty: TyId,
}

fn tys() -> Tys {
    let mut module = Module::new("scenarios");
    let data = module.tys.alloc_ty(TyData {
        name: "Ledger".into(),
        kind: TyKind::Class,
        sendable: false,
    });
    let fn_ty = module.tys.alloc_ty(TyData {
        name: "fn".into(),
        kind: TyKind::Fn,
        sendable: false,
    });
    let bool_ty = module.tys.alloc_ty(TyData {
        name: "Bool".into(),
        kind: TyKind::Bool,
        sendable: true,
    });
    Tys {
        module,
        data,
        fn_ty,
        bool_ty,
    }
}

fn checking_on() -> AnalysisConfig {
    AnalysisConfig {
        deferred_send_checking: true,
    }
}

fn span(b: &mut FunctionBuilder, file: &str, start: u32) -> SourceInfoId {
    b.source(Some(Span::new(file, start, start + 4)))
}

#[test]
fn sequential_transfer_reports_the_send_and_the_access() {
    let t = tys();
    let mut b = FunctionBuilder::new("sequential");
    let b0 = b.add_block();
    b.switch_to_block(b0);
    let x = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    let send_src = span(&mut b, "seq.tern", 10);
    b.apply(
        ApplyKind::Call,
        send,
        &[x],
        None,
        CallIsolation::Crossing,
        send_src,
    );
    let reader = b.function_ref("read", t.fn_ty, SourceInfoId::SYNTHETIC);
    let read_src = span(&mut b, "seq.tern", 30);
    b.apply(
        ApplyKind::Call,
        reader,
        &[x],
        None,
        CallIsolation::Local,
        read_src,
    );
    b.ret(None, SourceInfoId::SYNTHETIC);
    let func = b.finish();

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(
        diags,
        vec![
            SendDiagnostic::ConsumptionYieldsRace {
                site: InstId::inst(b0, 2),
                shown: 1,
                hidden: 0,
            },
            SendDiagnostic::PossibleRacyAccessSite {
                site: InstId::inst(b0, 4),
            },
        ]
    );

    // Rendering points at the send's span.
    let rendered = diags[0].render(&func);
    assert_eq!(rendered.primary_span(), Some(&Span::new("seq.tern", 10, 14)));
    assert_eq!(rendered.error_code.to_string(), "SEND-0001");
}

#[test]
fn merge_propagates_consumption_to_the_whole_region() {
    let t = tys();
    let mut b = FunctionBuilder::new("merged");
    let b0 = b.add_block();
    b.switch_to_block(b0);
    let x = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    let y = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    let mixer = b.function_ref("mix", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        mixer,
        &[x, y],
        None,
        CallIsolation::Local,
        SourceInfoId::SYNTHETIC,
    );
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        send,
        &[x],
        None,
        CallIsolation::Crossing,
        SourceInfoId::SYNTHETIC,
    );
    let reader = b.function_ref("read", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        reader,
        &[y],
        None,
        CallIsolation::Local,
        SourceInfoId::SYNTHETIC,
    );
    b.ret(None, SourceInfoId::SYNTHETIC);
    let func = b.finish();

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(
        diags,
        vec![
            SendDiagnostic::ConsumptionYieldsRace {
                site: InstId::inst(b0, 5),
                shown: 1,
                hidden: 0,
            },
            SendDiagnostic::PossibleRacyAccessSite {
                site: InstId::inst(b0, 7),
            },
        ]
    );
}

#[test]
fn reassignment_clears_consumption() {
    let t = tys();
    let mut b = FunctionBuilder::new("reassigned");
    let b0 = b.add_block();
    b.switch_to_block(b0);
    let slot = b.alloc_stack(t.data, SourceInfoId::SYNTHETIC);
    let x = b.load(slot, t.data, SourceInfoId::SYNTHETIC);
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        send,
        &[x],
        None,
        CallIsolation::Crossing,
        SourceInfoId::SYNTHETIC,
    );
    // Overwrite the slot with a fresh value; the old region stays consumed
    // but the slot no longer belongs to it.
    let fresh = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    b.store(fresh, slot, SourceInfoId::SYNTHETIC);
    let reloaded = b.load(slot, t.data, SourceInfoId::SYNTHETIC);
    let reader = b.function_ref("read", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        reader,
        &[reloaded],
        None,
        CallIsolation::Local,
        SourceInfoId::SYNTHETIC,
    );
    b.ret(None, SourceInfoId::SYNTHETIC);
    let func = b.finish();

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(diags, vec![]);
}

fn branch_scenario(t: &Tys) -> (tern_mir::Function, InstId, InstId) {
    let mut b = FunctionBuilder::new("branched");
    let b0 = b.add_block();
    let b1 = b.add_block();
    let b2 = b.add_block();
    let b3 = b.add_block();
    b.switch_to_block(b0);
    let x = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    let cond = b.literal(t.bool_ty, SourceInfoId::SYNTHETIC);
    b.branch(cond, b1, b2, SourceInfoId::SYNTHETIC);
    b.switch_to_block(b1);
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        send,
        &[x],
        None,
        CallIsolation::Crossing,
        SourceInfoId::SYNTHETIC,
    );
    b.goto(b3, SourceInfoId::SYNTHETIC);
    b.switch_to_block(b2);
    b.goto(b3, SourceInfoId::SYNTHETIC);
    b.switch_to_block(b3);
    let reader = b.function_ref("read", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        reader,
        &[x],
        None,
        CallIsolation::Local,
        SourceInfoId::SYNTHETIC,
    );
    b.ret(None, SourceInfoId::SYNTHETIC);
    (b.finish(), InstId::inst(b1, 1), InstId::inst(b3, 1))
}

#[test]
fn consumption_on_one_branch_reaches_the_join() {
    let t = tys();
    let (func, send_site, read_site) = branch_scenario(&t);

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(
        diags,
        vec![
            SendDiagnostic::ConsumptionYieldsRace {
                site: send_site,
                shown: 1,
                hidden: 0,
            },
            SendDiagnostic::PossibleRacyAccessSite { site: read_site },
        ]
    );
}

#[test]
fn diagnostics_are_deterministic_across_runs() {
    let t = tys();
    let (func, _, _) = branch_scenario(&t);

    let first = check_function(&t.module, &func, &checking_on());
    let second = check_function(&t.module, &func, &checking_on());
    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(|d| d.render(&func)).collect::<Vec<_>>(),
        second.iter().map(|d| d.render(&func)).collect::<Vec<_>>(),
    );
}

#[test]
fn consuming_the_argument_region_is_reported_at_the_send() {
    let t = tys();
    let mut b = FunctionBuilder::new("sends_arg");
    let arg = b.add_arg(t.data, ValueRepr::Object);
    let b0 = b.add_block();
    b.switch_to_block(b0);
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        send,
        &[arg],
        None,
        CallIsolation::Crossing,
        SourceInfoId::SYNTHETIC,
    );
    b.ret(None, SourceInfoId::SYNTHETIC);
    let func = b.finish();

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(
        diags,
        vec![SendDiagnostic::ArgRegionConsumed {
            site: InstId::inst(b0, 1),
        }]
    );
}

#[test]
fn loops_terminate_and_report_once() {
    let t = tys();
    let mut b = FunctionBuilder::new("looped");
    let b0 = b.add_block();
    let b1 = b.add_block();
    let b2 = b.add_block();
    b.switch_to_block(b0);
    let x = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    let cond = b.literal(t.bool_ty, SourceInfoId::SYNTHETIC);
    b.goto(b1, SourceInfoId::SYNTHETIC);
    b.switch_to_block(b1);
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        send,
        &[x],
        None,
        CallIsolation::Crossing,
        SourceInfoId::SYNTHETIC,
    );
    let reader = b.function_ref("read", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        reader,
        &[x],
        None,
        CallIsolation::Local,
        SourceInfoId::SYNTHETIC,
    );
    b.branch(cond, b1, b2, SourceInfoId::SYNTHETIC);
    b.switch_to_block(b2);
    b.ret(None, SourceInfoId::SYNTHETIC);
    let func = b.finish();

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(
        diags,
        vec![
            SendDiagnostic::ConsumptionYieldsRace {
                site: InstId::inst(b1, 1),
                shown: 1,
                hidden: 0,
            },
            SendDiagnostic::PossibleRacyAccessSite {
                site: InstId::inst(b1, 3),
            },
        ]
    );
}

#[test]
fn access_sites_beyond_the_reporting_limit_are_counted_not_listed() {
    let t = tys();
    let mut b = FunctionBuilder::new("many_accesses");
    let b0 = b.add_block();
    b.switch_to_block(b0);
    let x = b.alloc_ref(t.data, SourceInfoId::SYNTHETIC);
    let send = b.function_ref("send_to_actor", t.fn_ty, SourceInfoId::SYNTHETIC);
    b.apply(
        ApplyKind::Call,
        send,
        &[x],
        None,
        CallIsolation::Crossing,
        SourceInfoId::SYNTHETIC,
    );
    let reader = b.function_ref("read", t.fn_ty, SourceInfoId::SYNTHETIC);
    for _ in 0..6 {
        b.apply(
            ApplyKind::Call,
            reader,
            &[x],
            None,
            CallIsolation::Local,
            SourceInfoId::SYNTHETIC,
        );
    }
    b.ret(None, SourceInfoId::SYNTHETIC);
    let func = b.finish();

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(
        diags[0],
        SendDiagnostic::ConsumptionYieldsRace {
            site: InstId::inst(b0, 2),
            shown: 5,
            hidden: 1,
        }
    );
    let access_sites: Vec<_> = diags[1..]
        .iter()
        .map(|d| match d {
            SendDiagnostic::PossibleRacyAccessSite { site } => *site,
            other => panic!("expected access sites after the send, got {other:?}"),
        })
        .collect();
    // The five closest accesses, in op order.
    assert_eq!(
        access_sites,
        (4..9).map(|i| InstId::inst(b0, i)).collect::<Vec<_>>()
    );
}

#[test]
fn disabled_feature_gate_suppresses_all_diagnostics() {
    let t = tys();
    let (func, _, _) = branch_scenario(&t);

    let diags = check_function(&t.module, &func, &AnalysisConfig::default());
    assert_eq!(diags, vec![]);
}

#[test]
fn missing_sendable_protocol_suppresses_all_diagnostics() {
    let mut t = tys();
    t.module.sendable_protocol_available = false;
    let (func, _, _) = branch_scenario(&t);

    let diags = check_function(&t.module, &func, &checking_on());
    assert_eq!(diags, vec![]);
}
