//! Seed trucks and drivers installed on startup.

use common::ResourceKind;
use domain::Resource;
use saga::{Result, Service, Stores};

/// The trucks every fresh deployment starts with.
pub fn trucks() -> Vec<Resource> {
    vec![
        Resource::new(
            ResourceKind::Truck,
            "bc507a68-30c7-459d-b346-f0c5d6d56895",
            "F 3453 D",
        ),
        Resource::new(
            ResourceKind::Truck,
            "c0b5b0a1-5b9f-4b9f-8b1f-1b0b1b0b1b0b",
            "F 4335 A",
        ),
    ]
}

/// The drivers every fresh deployment starts with.
pub fn drivers() -> Vec<Resource> {
    vec![
        Resource::new(
            ResourceKind::Driver,
            "bd2af306-f7cc-4aee-bcaf-7c7a4e9a0a4e",
            "Meong 1",
        ),
        Resource::new(
            ResourceKind::Driver,
            "6a113d66-deca-4ce8-aa9e-9eb7865322c0",
            "Meong 2",
        ),
    ]
}

/// Replaces each resource collection with its seed set, all free.
pub async fn seed(stores: &Stores) -> Result<()> {
    seed_for(stores, &Service::ALL).await
}

/// Seeds only the resource services among `services`.
pub async fn seed_for(stores: &Stores, services: &[Service]) -> Result<()> {
    for (kind, resources) in [
        (ResourceKind::Truck, trucks()),
        (ResourceKind::Driver, drivers()),
    ] {
        if !services.contains(&Service::for_resource(kind)) {
            continue;
        }
        let count = resources.len();
        stores.resources(kind).seed(resources).await?;
        tracing::info!(%kind, count, "{kind}s seeded");
    }
    Ok(())
}
