use cluster_dsm::api;
use cluster_dsm::config::NodeConfig;
use cluster_dsm::dsm::failure::FailureHandler;
use cluster_dsm::dsm::manager::MemoryManager;
use cluster_dsm::membership::service::MembershipService;
use cluster_dsm::transport::tcp::TcpTransport;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--seed <addr:port>] [--config <file.json>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
            args[0]
        );

        std::process::exit(1);
    }

    let config = NodeConfig::from_args(&args)?;
    config.dsm.validate()?;

    tracing::info!("Starting node on {}", config.gossip_addr);
    if !config.seed_nodes.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seed_nodes);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership (UDP gossip):
    let membership = MembershipService::new(
        config.gossip_addr,
        config.dsm_addr,
        config.http_addr,
        config.seed_nodes.clone(),
    )
    .await?;
    let local_id = membership.local_node.id.clone();
    tracing::info!("Node ID: {}", local_id);

    // 2. Page transport, routed by membership:
    let transport = TcpTransport::new(local_id);
    for node in membership.get_alive_members() {
        transport.add_peer(node.id, node.dsm_addr);
    }
    tokio::spawn(transport.clone().track_membership(membership.subscribe()));

    // 3. DSM engine:
    let manager = MemoryManager::new(transport.clone(), config.dsm.clone());
    manager.start();

    let dsm_listener = tokio::net::TcpListener::bind(config.dsm_addr).await?;
    tokio::spawn(transport.clone().serve(dsm_listener, manager.clone()));

    tokio::spawn(FailureHandler::new(manager.clone()).run(membership.subscribe()));

    // 4. HTTP Router:
    let app = api::router(manager.clone(), membership.clone());

    // 5. Spawn membership service:
    let service_clone = membership.clone();
    tokio::spawn(async move {
        service_clone.start().await;
    });

    // 6. Spawn stats reporter:
    let stats_service = membership.clone();
    let stats_manager = manager.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let alive = stats_service.get_alive_members();
            tracing::info!("Cluster stats: {} alive nodes", alive.len());
            for node in alive {
                tracing::info!(
                    "  - {} gossip={} dsm={} http={} (inc={})",
                    node.id,
                    node.gossip_addr,
                    node.dsm_addr,
                    node.http_addr,
                    node.incarnation
                );
            }

            let cache = stats_manager.cache_stats();
            tracing::info!(
                "Page cache: {}/{} pages (once={}, frequent={}), hits={} misses={} evictions={}, {} active lease(s)",
                cache.size,
                cache.capacity,
                cache.once_len,
                cache.frequent_len,
                cache.hits,
                cache.misses,
                cache.evictions,
                stats_manager.lease_manager().lease_count()
            );
        }
    });

    // 7. Start HTTP server:
    tracing::info!("HTTP server listening on {}", config.http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;
    axum::serve(listener, app).await?;

    manager.shutdown();
    Ok(())
}
