/// Smoke-test for `BrowserPool`.
///
/// Launches the pool, leases a page, navigates to <https://example.com>,
/// and verifies page-count accounting plus a second lease reusing the same
/// session.
///
/// Run with:
///   cargo run -p vigia-portal --example pool_smoke
use vigia_portal::{BrowserPool, BrowserPoolConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    println!("Launching browser pool…");
    let pool = BrowserPool::new(BrowserPoolConfig {
        size: 1,
        ..Default::default()
    });

    {
        let lease = pool.acquire().await?;
        lease.page().goto("https://example.com").await?;
        lease.page().wait_for_navigation().await?;
        let html = lease.page().content().await?;
        assert!(
            html.contains("Example Domain"),
            "Expected marker not found in rendered HTML"
        );
        println!("OK — got {} bytes of rendered HTML", html.len());
    }

    // Give the lease's release task a beat, then lease again.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let stats = pool.stats();
    println!("Stats after release: {stats:?}");
    assert_eq!(stats.in_use, 0, "lease should have been returned");

    let second = pool.acquire().await?;
    drop(second);

    pool.drain().await;
    println!("Pool drained cleanly");
    Ok(())
}
