use anyhow::Context;
use donation_distribution::{
    api::{self, Caller, DistributePayload},
    directory::PartyDraft,
    donation::{DonationDraft, DonationStatus},
    error::ErrorKind,
    history::HistoryAction,
    matching::ExactPayload,
    request::RequestDraft,
    service::{Decision, DecisionRequest, DistributionService},
    store::Store,
    types::Role,
};
use sled::open;
use std::sync::Arc;

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

struct World {
    _dir: TempDir,
    service: DistributionService,
    donor: String,
    ngo: String,
    other_ngo: String,
    orphanage: String,
}

// Sled locks its directory, so every test opens its own database under a temp dir.
fn world(name: &str) -> anyhow::Result<World> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    let service = DistributionService::new(Arc::new(Store::from_db(db)?));

    let directory = service.store().directory();
    let register = |role: Role, name: &str| -> anyhow::Result<String> {
        let party = directory
            .register(
                PartyDraft::new()
                    .set_role(role)
                    .set_name(name)
                    .set_email("contact@example.org"),
            )
            .with_context(|| format!("registering {name}"))?;
        Ok(party.id)
    };
    let donor = register(Role::Donor, "Do1")?;
    let ngo = register(Role::Ngo, "N1")?;
    let other_ngo = register(Role::Ngo, "N2")?;
    let orphanage = register(Role::Orphanage, "Orphan House")?;

    Ok(World {
        _dir: temp_dir,
        service,
        donor,
        ngo,
        other_ngo,
        orphanage,
    })
}

// donation d1 (MONEY 100, ngo N1, donor Do1) and request r1 (orphanage O1 -> N1, MONEY)
fn seed(w: &World) -> anyhow::Result<(String, String)> {
    let d1 = w.service.pledge(
        &w.donor,
        DonationDraft::new()
            .set_donor(&w.donor)
            .set_ngo(&w.ngo)
            .set_money(100),
    )?;
    let r1 = w.service.request(
        &w.orphanage,
        RequestDraft::new()
            .set_orphanage(&w.orphanage)
            .set_ngo(&w.ngo)
            .set_money(250),
    )?;
    Ok((d1.id, r1.id))
}

#[test]
fn accept_distributes_and_clears_request() -> anyhow::Result<()> {
    let w = world("accept.db")?;
    let (d1, r1) = seed(&w)?;

    let decision = w
        .service
        .decide(&w.ngo, &DecisionRequest::accept(&d1, "Orphan House"))
        .context("Decision failed on accept: ")?;

    let Decision::Accepted {
        donation,
        distribution,
    } = decision
    else {
        panic!("expected an accepted decision");
    };
    assert_eq!(donation.status, DonationStatus::Distributed);
    assert_eq!(donation.distributed_to_name.as_deref(), Some("Orphan House"));

    let store = w.service.store();
    let stored = store.donations().get(&d1)?.context("donation missing")?;
    assert_eq!(stored, donation);

    let history = store.history().for_donation(&d1)?;
    assert_eq!(history, vec![distribution.clone()]);
    assert_eq!(distribution.donation_id, d1);
    assert_eq!(distribution.ngo_id, w.ngo);
    assert_eq!(distribution.orphanage_id.as_deref(), Some(w.orphanage.as_str()));
    assert_eq!(distribution.donor_id, w.donor);
    assert_eq!(distribution.action, HistoryAction::Accepted);

    assert!(store.requests().get(&r1)?.is_none());
    assert_eq!(
        store.history().accepted_for_orphanage(&w.orphanage)?,
        vec![distribution]
    );

    Ok(())
}

#[test]
fn reject_keeps_donation_pending() -> anyhow::Result<()> {
    let w = world("reject.db")?;
    let (d1, r1) = seed(&w)?;

    let decision = w
        .service
        .decide(&w.ngo, &DecisionRequest::reject(&d1))
        .context("Decision failed on reject: ")?;
    assert_eq!(
        decision,
        Decision::Rejected {
            donation_id: d1.clone()
        }
    );

    let store = w.service.store();
    let stored = store.donations().get(&d1)?.context("donation missing")?;
    assert_eq!(stored.status, DonationStatus::Pending);
    assert!(stored.distributed_to_name.is_none());

    let history = store.history().for_donation(&d1)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Rejected);
    assert!(history[0].orphanage_id.is_none());
    assert_eq!(history[0].donor_id, w.donor);

    assert!(store.requests().get(&r1)?.is_some());
    assert!(store.history().accepted_for_orphanage(&w.orphanage)?.is_empty());

    Ok(())
}

#[test]
fn rejected_donation_can_still_be_accepted() -> anyhow::Result<()> {
    let w = world("reject_then_accept.db")?;
    let (d1, _) = seed(&w)?;

    w.service.decide(&w.ngo, &DecisionRequest::reject(&d1))?;
    w.service.decide(&w.ngo, &DecisionRequest::reject(&d1))?;
    w.service
        .decide(&w.ngo, &DecisionRequest::accept(&d1, "Orphan House"))?;

    let actions: Vec<_> = w
        .service
        .store()
        .history()
        .for_donation(&d1)?
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(
        actions,
        vec![
            HistoryAction::Rejected,
            HistoryAction::Rejected,
            HistoryAction::Accepted
        ]
    );

    Ok(())
}

#[test]
fn second_decision_on_distributed_donation_conflicts() -> anyhow::Result<()> {
    let w = world("conflict.db")?;
    let (d1, _) = seed(&w)?;
    register_orphanage(&w.service, "Second Home")?;

    w.service
        .decide(&w.ngo, &DecisionRequest::accept(&d1, "Orphan House"))?;

    let err = w
        .service
        .decide(&w.ngo, &DecisionRequest::accept(&d1, "Second Home"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let err = w
        .service
        .decide(&w.ngo, &DecisionRequest::reject(&d1))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let store = w.service.store();
    let stored = store.donations().get(&d1)?.context("donation missing")?;
    assert_eq!(stored.distributed_to_name.as_deref(), Some("Orphan House"));
    assert_eq!(store.history().for_donation(&d1)?.len(), 1);

    Ok(())
}

#[test]
fn unknown_orphanage_changes_nothing() -> anyhow::Result<()> {
    let w = world("unknown_orphanage.db")?;
    let (d1, r1) = seed(&w)?;

    let err = w
        .service
        .decide(&w.ngo, &DecisionRequest::accept(&d1, "orphan house"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.to_string(), "Orphanage not found by that name");

    let store = w.service.store();
    let stored = store.donations().get(&d1)?.context("donation missing")?;
    assert_eq!(stored.status, DonationStatus::Pending);
    assert!(store.history().for_donation(&d1)?.is_empty());
    assert!(store.requests().get(&r1)?.is_some());

    Ok(())
}

#[test]
fn foreign_ngo_is_forbidden() -> anyhow::Result<()> {
    let w = world("forbidden.db")?;
    let (d1, r1) = seed(&w)?;

    for request in [
        DecisionRequest::accept(&d1, "Orphan House"),
        DecisionRequest::reject(&d1),
    ] {
        let err = w.service.decide(&w.other_ngo, &request).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    let store = w.service.store();
    let stored = store.donations().get(&d1)?.context("donation missing")?;
    assert_eq!(stored.status, DonationStatus::Pending);
    assert!(store.history().for_donation(&d1)?.is_empty());
    assert!(store.requests().get(&r1)?.is_some());

    Ok(())
}

#[test]
fn missing_donation_is_not_found() -> anyhow::Result<()> {
    let w = world("missing.db")?;
    let err = w
        .service
        .decide(&w.ngo, &DecisionRequest::reject("donation_1missing"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[test]
fn accept_removes_only_pending_requests_of_the_same_kind() -> anyhow::Result<()> {
    let w = world("kind_match.db")?;
    let (d1, r1) = seed(&w)?;

    let another_money = w.service.request(
        &w.orphanage,
        RequestDraft::new()
            .set_orphanage(&w.orphanage)
            .set_ngo(&w.ngo)
            .set_money(10),
    )?;
    let items = w.service.request(
        &w.orphanage,
        RequestDraft::new()
            .set_orphanage(&w.orphanage)
            .set_ngo(&w.ngo)
            .set_item("blankets", 20),
    )?;
    let to_other_ngo = w.service.request(
        &w.orphanage,
        RequestDraft::new()
            .set_orphanage(&w.orphanage)
            .set_ngo(&w.other_ngo)
            .set_money(10),
    )?;

    w.service
        .decide(&w.ngo, &DecisionRequest::accept(&d1, "Orphan House"))?;

    let requests = w.service.store().requests();
    // delete-by-kind is deliberately loose: both money asks go
    assert!(requests.get(&r1)?.is_none());
    assert!(requests.get(&another_money.id)?.is_none());
    assert!(requests.get(&items.id)?.is_some());
    assert!(requests.get(&to_other_ngo.id)?.is_some());

    Ok(())
}

#[test]
fn exact_payload_policy_keeps_unrelated_requests() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join("exact_match.db"))?;
    let service =
        DistributionService::new(Arc::new(Store::from_db(db)?)).with_matcher(ExactPayload);

    let directory = service.store().directory();
    let donor = directory.register(
        PartyDraft::new()
            .set_role(Role::Donor)
            .set_name("Do1")
            .set_email("do1@example.org"),
    )?;
    let ngo = directory.register(
        PartyDraft::new()
            .set_role(Role::Ngo)
            .set_name("N1")
            .set_email("n1@example.org"),
    )?;
    let home = directory.register(
        PartyDraft::new()
            .set_role(Role::Orphanage)
            .set_name("Orphan House")
            .set_email("home@example.org"),
    )?;

    let donation = service.pledge(
        &donor.id,
        DonationDraft::new()
            .set_donor(&donor.id)
            .set_ngo(&ngo.id)
            .set_item("blankets", 20),
    )?;
    let exact = service.request(
        &home.id,
        RequestDraft::new()
            .set_orphanage(&home.id)
            .set_ngo(&ngo.id)
            .set_item("blankets", 20),
    )?;
    let different = service.request(
        &home.id,
        RequestDraft::new()
            .set_orphanage(&home.id)
            .set_ngo(&ngo.id)
            .set_item("rice", 20),
    )?;

    service.decide(&ngo.id, &DecisionRequest::accept(&donation.id, "Orphan House"))?;

    assert!(service.store().requests().get(&exact.id)?.is_none());
    assert!(service.store().requests().get(&different.id)?.is_some());

    Ok(())
}

#[test]
fn concurrent_accepts_commit_once() -> anyhow::Result<()> {
    let w = world("concurrent.db")?;
    let (d1, _) = seed(&w)?;
    register_orphanage(&w.service, "Second Home")?;

    let outcomes: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = ["Orphan House", "Second Home", "Orphan House", "Second Home"]
            .into_iter()
            .map(|name| {
                let service = &w.service;
                let ngo = &w.ngo;
                let d1 = &d1;
                s.spawn(move || service.decide(ngo, &DecisionRequest::accept(d1, name)))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("decision thread panicked"))
            .collect()
    });

    let accepted = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(accepted, 1);
    for outcome in outcomes.iter().filter_map(|o| o.as_ref().err()) {
        assert_eq!(outcome.kind(), ErrorKind::Conflict);
    }

    let history = w.service.store().history().for_donation(&d1)?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, HistoryAction::Accepted);

    Ok(())
}

#[test]
fn api_envelope_reports_status() -> anyhow::Result<()> {
    let w = world("api.db")?;
    let (d1, _) = seed(&w)?;
    let caller = Caller {
        user_id: w.ngo.clone(),
        role: Role::Ngo,
    };

    let bad_action = DistributePayload {
        donation_id: Some(d1.clone()),
        orphanage_name: Some("Orphan House".into()),
        action: Some("approve".into()),
    };
    let envelope = api::distribute(&w.service, &caller, &w.ngo, &bad_action);
    assert_eq!(envelope.status, 400);
    assert!(!envelope.success);

    let accept = DistributePayload {
        action: Some("accept".into()),
        ..bad_action
    };
    let impostor = Caller {
        user_id: w.other_ngo.clone(),
        role: Role::Ngo,
    };
    assert_eq!(api::distribute(&w.service, &impostor, &w.ngo, &accept).status, 403);
    let donor = Caller {
        user_id: w.ngo.clone(),
        role: Role::Donor,
    };
    assert_eq!(api::distribute(&w.service, &donor, &w.ngo, &accept).status, 403);

    let envelope = api::distribute(&w.service, &caller, &w.ngo, &accept);
    assert!(envelope.success);
    assert_eq!(envelope.status, 200);
    assert_eq!(envelope.message, "Donation accepted and distributed");
    assert!(matches!(envelope.data, Some(Decision::Accepted { .. })));

    let envelope = api::distribute(&w.service, &caller, &w.ngo, &accept);
    assert_eq!(envelope.status, 409);

    Ok(())
}

fn register_orphanage(service: &DistributionService, name: &str) -> anyhow::Result<String> {
    let party = service.store().directory().register(
        PartyDraft::new()
            .set_role(Role::Orphanage)
            .set_name(name)
            .set_email("home@example.org"),
    )?;
    Ok(party.id)
}
