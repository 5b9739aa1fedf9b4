//! # Seed Data Generator
//!
//! Provisions a local cloud database with demo sites and a grant, so the
//! relay can be exercised without the management API.
//!
//! ## Usage
//! ```bash
//! cargo run -p canopy-db --bin seed -- --db ./canopy_cloud.db --sites 3
//! ```

use chrono::Utc;
use std::env;
use uuid::Uuid;

use canopy_core::{validation::validate_site_name, Site, SiteStatus};
use canopy_db::{Database, DbConfig};

/// Tenant that owns the demo sites.
const DEMO_TENANT_ID: &str = "00000000-0000-0000-0000-000000000001";

/// User granted access to the first demo site.
const DEMO_VIEWER_ID: &str = "demo-viewer";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 3;
    let mut db_path = String::from("./canopy_cloud.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--sites" | "-s" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(3);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Canopy Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -s, --sites <N>    Number of demo sites (default: 3)");
                println!("  -d, --db <PATH>    Database file path (default: ./canopy_cloud.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Canopy Seed Data Generator");
    println!("Database: {}", db_path);

    let db = Database::new(DbConfig::new(&db_path)).await?;

    for n in 1..=count {
        let name = format!("demo-site-{n:02}");
        validate_site_name(&name)?;

        if db.sites().get_by_name(&name).await?.is_some() {
            println!("  {name} already exists, skipping");
            continue;
        }

        let site = Site {
            id: Uuid::new_v4().to_string(),
            name: name.clone(),
            tenant_id: DEMO_TENANT_ID.to_string(),
            status: SiteStatus::Active,
            last_contact_at: None,
            created_at: Utc::now(),
        };
        db.sites().insert(&site).await?;

        if n == 1 {
            db.grants().grant(DEMO_VIEWER_ID, &site.id).await?;
            println!("  {name} ({}) granted to {DEMO_VIEWER_ID}", site.id);
        } else {
            println!("  {name} ({})", site.id);
        }
    }

    db.close().await;
    Ok(())
}
