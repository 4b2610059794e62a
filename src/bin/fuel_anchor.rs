//! Operator CLI for the fuel settlement core.
//!
//! Offline helpers (wallet generation, geofence distances), an end-to-end demo
//! against the in-process ledger, and with the `net` feature read-only history
//! and test-network funding against a live gateway.

#[cfg(feature = "net")]
use fuel_anchor::{AccountId, FriendbotFaucet, HistoryPager, HorizonTransport};
use fuel_anchor::{
    haversine_distance_m, Amount, Asset, AssetAuthorizer, DriverId, DriverLimits, DriverProfile,
    Fleet, FleetBudget, FleetFunding, FleetId, FuelPrice, FuelType, GeoPoint, KeyManager,
    LedgerClient, MemoryLedger, MemoryStore, Network, RedemptionCoordinator, RedemptionRequest,
    SequenceCache, SettlementConfig, SettlementError, Station, StationId, Submitter,
    TransferEngine,
};
use std::{env, future::Future, sync::Arc};
use tracing_subscriber::EnvFilter;

fn fatal(message: &str) -> ! {
    eprintln!("{message}");
    std::process::exit(1);
}

fn print_help() {
    println!("Usage: fuel-anchor <command> ...");
    println!("  wallet new [--network testnet|mainnet] [--reveal]");
    println!("  geo distance <lat1> <lng1> <lat2> <lng2>");
    println!("  demo");
    #[cfg(feature = "net")]
    {
        println!("  history <account> [--limit N]");
        println!("  fund <account>");
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn block_on<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|err| fatal(&format!("failed to start runtime: {err}")));
    runtime.block_on(future)
}

fn main() {
    init_logging();
    let mut args = env::args().skip(1);
    let command = args.next();
    match command.as_deref() {
        Some("wallet") => match args.next().as_deref() {
            Some("new") => cmd_wallet_new(args.collect()),
            _ => fatal("Usage: fuel-anchor wallet new [--network testnet|mainnet] [--reveal]"),
        },
        Some("geo") => match args.next().as_deref() {
            Some("distance") => cmd_geo_distance(args.collect()),
            _ => fatal("Usage: fuel-anchor geo distance <lat1> <lng1> <lat2> <lng2>"),
        },
        Some("demo") => {
            if let Err(err) = block_on(run_demo()) {
                fatal(&format!("demo failed: {} ({err})", err.code()));
            }
        }
        #[cfg(feature = "net")]
        Some("history") => cmd_history(args.collect()),
        #[cfg(feature = "net")]
        Some("fund") => cmd_fund(args.collect()),
        Some("-h") | Some("--help") | None => print_help(),
        Some(other) => {
            eprintln!("Unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn cmd_wallet_new(args: Vec<String>) {
    let mut network = Network::Testnet;
    let mut reveal = false;
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--reveal" => reveal = true,
            "--network" => {
                network = match iter.next().as_deref() {
                    Some("testnet") => Network::Testnet,
                    Some("mainnet") => Network::Mainnet,
                    _ => fatal("--network expects testnet or mainnet"),
                };
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let wallet = KeyManager::new(network.clone()).create_wallet();
    println!("identity: {}", wallet.identity());
    if reveal {
        match wallet.reveal_secret(&network) {
            Ok(secret) => println!("secret:   {}", secret.as_str()),
            Err(err) => fatal(&format!("{err}")),
        }
    }
}

fn parse_coordinate(value: &str) -> f64 {
    value
        .parse()
        .unwrap_or_else(|_| fatal(&format!("invalid coordinate: {value}")))
}

fn cmd_geo_distance(args: Vec<String>) {
    if args.len() != 4 {
        fatal("Usage: fuel-anchor geo distance <lat1> <lng1> <lat2> <lng2>");
    }
    let point = |lat: &str, lng: &str| {
        GeoPoint::new(parse_coordinate(lat), parse_coordinate(lng))
            .unwrap_or_else(|err| fatal(&format!("{err}")))
    };
    let a = point(&args[0], &args[1]);
    let b = point(&args[2], &args[3]);
    println!("{:.1} m", haversine_distance_m(&a, &b));
}

/// Purchase, allocation and two redemptions against an in-process ledger.
async fn run_demo() -> Result<(), SettlementError> {
    let keys = KeyManager::new(Network::Testnet);
    let issuer = keys.create_wallet();
    let config = SettlementConfig::new(Network::Testnet, Asset::new("FUEL", issuer.identity().clone()))
        .with_distributor(issuer.secret().clone());
    let ledger = Arc::new(MemoryLedger::new(config.network.passphrase()));
    ledger.create_account(issuer.identity());
    let submitter = Submitter::new(LedgerClient::new(ledger.clone(), &config), Arc::new(SequenceCache::new()));
    let authorizer = AssetAuthorizer::new(
        submitter.clone(),
        config.asset.clone(),
        config.holding_ceiling,
        config.timeouts.confirm,
    );
    let transfers = TransferEngine::new(submitter, &config);
    let store = Arc::new(MemoryStore::new());

    let fleet_wallet = keys.create_wallet();
    let driver_wallet = keys.create_wallet();
    let station_wallet = keys.create_wallet();
    for wallet in [&fleet_wallet, &driver_wallet, &station_wallet] {
        ledger.create_account(wallet.identity());
        authorizer.authorize(wallet, None).await?;
    }

    let pump = GeoPoint::new(-1.2833, 36.8167)?;
    let mut station = Station::new(
        StationId::new("st-moi-avenue"),
        "Moi Avenue",
        station_wallet.identity().clone(),
        pump,
    );
    station.fuel_prices.push(FuelPrice {
        fuel_type: FuelType::Diesel,
        price_per_liter: Amount::parse("1.85")?,
    });
    let fleet_id = FleetId::new("fl-demo");
    let driver_id = DriverId::new("dr-demo");
    store.insert_station(station.clone())?;
    store.insert_fleet(Fleet {
        id: fleet_id.clone(),
        name: "Demo Logistics".into(),
        wallet: fleet_wallet.identity().clone(),
        budget: FleetBudget::new(),
    })?;
    store.insert_driver(DriverProfile {
        id: driver_id.clone(),
        wallet: driver_wallet.identity().clone(),
        fleet: Some(fleet_id.clone()),
        limits: DriverLimits::from_daily(Amount::from_units(100), Amount::from_units(150)),
        allowed_stations: Vec::new(),
        active: true,
    })?;
    let driver_identity = driver_wallet.identity().clone();
    for wallet in [fleet_wallet, driver_wallet] {
        store.insert_wallet(wallet)?;
    }

    let funding = FleetFunding::new(store.clone(), transfers.clone());
    let purchase = funding.purchase(&fleet_id, Amount::from_units(1_000), "DEMO-INV-1").await?;
    println!("fleet funded: remaining {}", purchase.budget.remaining());
    let allocation = funding.distribute(&fleet_id, &driver_id, Amount::from_units(200)).await?;
    println!("driver allocated: {} ({})", allocation.receipt.amount, allocation.receipt.hash);

    let coordinator = RedemptionCoordinator::new(store.clone(), transfers.clone()).with_fleet_locks(funding.fleet_locks());
    let request = |amount: i64, lat: f64| RedemptionRequest {
        station: station.id.clone(),
        driver_wallet: driver_identity.clone(),
        fuel_type: FuelType::Diesel,
        amount: Amount::from_units(amount),
        liters: amount as f64 / 1.85,
        latitude: lat,
        longitude: pump.lng(),
        vehicle_id: Some("KDA 123X".into()),
    };
    let record = coordinator.redeem(request(74, pump.lat())).await?;
    match serde_json::to_string_pretty(&record) {
        Ok(json) => println!("{json}"),
        Err(err) => eprintln!("failed to encode redemption: {err}"),
    }
    if let Err(err) = coordinator.redeem(request(10, pump.lat() + 0.01)).await {
        println!("second redemption refused: {} ({err})", err.code());
    }
    println!(
        "station balance {}, driver balance {}",
        ledger.balance(&station.wallet, &config.asset),
        ledger.balance(&driver_identity, &config.asset)
    );
    Ok(())
}

#[cfg(feature = "net")]
fn load_config() -> SettlementConfig {
    SettlementConfig::from_env().unwrap_or_else(|err| fatal(&format!("{err}")))
}

#[cfg(feature = "net")]
fn parse_account(value: Option<String>) -> AccountId {
    let value = value.unwrap_or_else(|| fatal("missing <account>"));
    AccountId::parse(&value).unwrap_or_else(|err| fatal(&format!("{err}")))
}

#[cfg(feature = "net")]
fn cmd_history(args: Vec<String>) {
    let mut iter = args.into_iter();
    let account = parse_account(iter.next());
    let mut limit = 10usize;
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--limit" => {
                let value = iter.next().unwrap_or_else(|| fatal("--limit expects a value"));
                limit = value
                    .parse()
                    .unwrap_or_else(|_| fatal("invalid --limit value"));
            }
            other => fatal(&format!("unknown argument: {other}")),
        }
    }
    let config = load_config();
    let transport = HorizonTransport::new(&config).unwrap_or_else(|err| fatal(&format!("{err}")));
    let client = LedgerClient::new(Arc::new(transport), &config);
    let result = block_on(async move {
        let mut pager = HistoryPager::new(client, account, limit);
        pager.next_page().await
    });
    match result {
        Ok(Some(records)) => {
            for record in records {
                println!(
                    "{} ledger={} ok={} memo={}",
                    record.hash,
                    record.ledger,
                    record.successful,
                    record.memo.as_text().unwrap_or("-")
                );
            }
        }
        Ok(None) => println!("no transactions"),
        Err(err) => fatal(&format!("history failed: {} ({err})", err.code())),
    }
}

#[cfg(feature = "net")]
fn cmd_fund(args: Vec<String>) {
    let account = parse_account(args.into_iter().next());
    let config = load_config();
    let url = config
        .friendbot_url
        .clone()
        .unwrap_or_else(|| fatal("no faucet endpoint configured (FUEL_FRIENDBOT_URL)"));
    let faucet = FriendbotFaucet::new(url, config.timeouts.request)
        .unwrap_or_else(|err| fatal(&format!("{err}")));
    let keys = KeyManager::new(config.network.clone()).with_faucet(Arc::new(faucet));
    match block_on(async move { keys.fund_on_test_network(&account).await }) {
        Ok(()) => println!("funded"),
        Err(err) => fatal(&format!("funding failed: {} ({err})", err.code())),
    }
}
