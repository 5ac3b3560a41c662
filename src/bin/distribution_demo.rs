//! Seeds a donor, an NGO and an orphanage into the configured store, then walks one
//! donation through the distribution workflow.

use anyhow::{Context, Result};
use donation_distribution::{
    api::{self, Caller, DistributePayload},
    config::StoreConfig,
    directory::PartyDraft,
    donation::DonationDraft,
    request::RequestDraft,
    service::DistributionService,
    store::Store,
    types::Role,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,donation_distribution=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let config = StoreConfig::from_env().context("invalid store configuration")?;
    let store = Store::open(&config).context("failed to open store")?;
    let service = DistributionService::new(Arc::new(store));

    let directory = service.store().directory();
    let register = |role: Role, name: &str, email: &str| {
        directory
            .register(
                PartyDraft::new()
                    .set_role(role)
                    .set_name(name)
                    .set_email(email),
            )
            .with_context(|| format!("failed to register {name}"))
    };
    let donor = register(Role::Donor, "Demo Donor", "donor@example.org")?;
    let ngo = register(Role::Ngo, "Demo Relief", "relief@example.org")?;
    let orphanage = register(Role::Orphanage, "Orphan House", "house@example.org")?;

    let donation = service.pledge(
        &donor.id,
        DonationDraft::new()
            .set_donor(&donor.id)
            .set_ngo(&ngo.id)
            .set_money(100),
    )?;
    service.request(
        &orphanage.id,
        RequestDraft::new()
            .set_orphanage(&orphanage.id)
            .set_ngo(&ngo.id)
            .set_money(100),
    )?;

    let caller = Caller {
        user_id: ngo.id.clone(),
        role: Role::Ngo,
    };
    let payload = DistributePayload {
        donation_id: Some(donation.id.clone()),
        orphanage_name: Some(orphanage.name.clone()),
        action: Some("accept".into()),
    };
    let envelope = api::distribute(&service, &caller, &ngo.id, &payload);
    tracing::info!(status = envelope.status, message = %envelope.message, "decision applied");

    for entry in service.store().history().for_donation(&donation.id)? {
        tracing::info!(
            history_id = %entry.id,
            action = ?entry.action,
            orphanage_id = ?entry.orphanage_id,
            "history"
        );
    }

    service.store().flush()?;
    Ok(())
}
