use anyhow::Result;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use collectible_market::{
    AcceptAllVerifier, CollectibleRegistry, Db, ListingFilter, ListingLedger, MediaKind,
    ProfileDirectory, PurchaseCoordinator, TelegramIdentity, WalletRef, CURRENCY,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("init") => run_init()?,
        Some("demo") => run_demo()?,
        Some("status") => run_status()?,
        _ => print_usage(),
    }

    Ok(())
}

fn db_path() -> PathBuf {
    env::var("MARKET_DB")
        .unwrap_or_else(|_| "market.db".to_string())
        .into()
}

fn print_usage() {
    println!("Collectible Market v{}", collectible_market::VERSION);
    println!();
    println!("Usage:");
    println!("  collectible-market init     Create the database and schema");
    println!("  collectible-market demo     Seed demo data and walk one purchase");
    println!("  collectible-market status   Print entity counts");
    println!();
    println!("  MARKET_DB=<path> overrides the database location (default: market.db)");
}

fn run_init() -> Result<()> {
    let path = db_path();
    println!("🗄️  Initializing marketplace database at {:?}", path);

    Db::open(&path)?;
    println!("✓ Schema installed (WAL mode enabled)");

    Ok(())
}

fn run_demo() -> Result<()> {
    let path = db_path();
    println!("🛒 Collectible Market demo");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let db = Db::open(&path)?;
    let profiles = ProfileDirectory::new(db.clone());
    let collectibles = CollectibleRegistry::new(db.clone());
    let ledger = ListingLedger::new(db.clone());
    let coordinator = PurchaseCoordinator::new(
        db.clone(),
        ledger.clone(),
        collectibles.clone(),
        Arc::new(AcceptAllVerifier),
    );

    // 1. Resolve two profiles from their platform identities
    println!("\n👤 Resolving profiles...");
    let seller = profiles.resolve(Some(&TelegramIdentity {
        telegram_id: 111,
        username: Some("demo_seller".to_string()),
        first_name: None,
        last_name: None,
    }))?;
    let buyer = profiles.resolve(Some(&TelegramIdentity {
        telegram_id: 222,
        username: Some("demo_buyer".to_string()),
        first_name: None,
        last_name: None,
    }))?;
    println!("✓ Seller: {} ({})", seller.display_name(), seller.id);
    println!("✓ Buyer:  {} ({})", buyer.display_name(), buyer.id);

    // 2. Seller mints a collectible and lists it
    println!("\n🖼️  Creating collectible and listing...");
    let collectible = collectibles.create(
        &seller.id,
        "Rare Telegram Sticker Pack",
        "First-edition animated pack",
        "https://placehold.co/600x400/png",
        MediaKind::Image,
        HashMap::from([("edition".to_string(), serde_json::json!(1))]),
    )?;
    let listing = ledger.create_listing(&collectible.id, &seller.id, 10.5)?;
    println!(
        "✓ Listed \"{}\" for {} {}",
        collectible.title, listing.price, CURRENCY
    );

    // 3. Marketplace view
    let active = ledger.list_active(&ListingFilter::default())?;
    println!("✓ Active listings: {}", active.len());

    // 4. Buyer purchases with an idempotent request
    println!("\n💸 Purchasing...");
    let record = coordinator.purchase(
        &listing.id,
        &buyer.id,
        &WalletRef {
            address: "EQdemo-buyer-wallet".to_string(),
            tx_reference: "demo-tx-1".to_string(),
        },
        "demo-purchase-1",
    )?;
    println!(
        "✓ Purchase complete: {} {} paid (record {})",
        record.price_paid, CURRENCY, record.id
    );

    let owned = collectibles.by_owner(&buyer.id)?;
    println!("✓ Buyer now owns {} collectible(s)", owned.len());

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("🎉 Demo complete");

    Ok(())
}

fn run_status() -> Result<()> {
    let path = db_path();
    if !path.exists() {
        eprintln!("❌ Database not found at {:?}", path);
        eprintln!("   Run: collectible-market init");
        std::process::exit(1);
    }

    let db = Db::open(&path)?;
    let profiles = ProfileDirectory::new(db.clone());
    let collectibles = CollectibleRegistry::new(db.clone());
    let ledger = ListingLedger::new(db.clone());

    println!("📊 Marketplace status ({:?})", path);
    println!("✓ Profiles:        {}", profiles.count()?);
    println!("✓ Collectibles:    {}", collectibles.count()?);
    println!(
        "✓ Active listings: {}",
        ledger.list_active(&ListingFilter::default())?.len()
    );

    Ok(())
}
