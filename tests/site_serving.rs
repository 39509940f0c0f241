// Integration tests for the bundled site pipeline served over real sockets
use std::{fs, net::SocketAddr, path::Path, time::Duration};

use sphinx::{
    CancelReason, Lifetime, Supervisor,
    adapters::site::{self, ADMIN_COOKIE},
    config::ServerConfig,
    core::supervisor::{PRIMARY_LISTENER, REDIRECT_LISTENER},
};
use tempfile::TempDir;

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn data_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    fs::create_dir_all(root.join("static/www/round1")).unwrap();
    fs::write(root.join("static/404.html"), "<h1>not found</h1>").unwrap();
    fs::write(root.join("static/429.html"), "<h1>slow down</h1>").unwrap();
    fs::write(root.join("static/www/style.css"), "body { color: red }").unwrap();
    fs::write(root.join("static/www/round1/index.html"), "<h1>round 1</h1>").unwrap();
    dir
}

fn write_certificate(dir: &Path) -> (String, String) {
    let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = dir.join("cert.pem");
    let key = dir.join("key.pem");
    fs::write(&cert, generated.cert.pem()).unwrap();
    fs::write(&key, generated.signing_key.serialize_pem()).unwrap();
    (
        cert.to_string_lossy().into_owned(),
        key.to_string_lossy().into_owned(),
    )
}

// An empty host binds every interface and skips the canonical-host redirect.
fn config(dir: &TempDir, period: Duration, max_concurrent: usize) -> ServerConfig {
    ServerConfig::builder()
        .port(free_port())
        .admission(1, period, max_concurrent)
        .shutdown_timeout(Duration::from_secs(2))
        .data_dir(dir.path().to_string_lossy())
        .admin_key("sesame")
        .build()
}

async fn start(
    supervisor: Supervisor,
    listener: &str,
) -> (
    SocketAddr,
    Lifetime,
    tokio::task::JoinHandle<Result<(), sphinx::RunError>>,
) {
    let mut bound = supervisor.subscribe_bound(listener).unwrap();
    let lifetime = Lifetime::new();
    let run = tokio::spawn(supervisor.run(lifetime.clone()));
    let addr = bound.wait_for(Option::is_some).await.unwrap().unwrap();
    (
        SocketAddr::from(([127, 0, 0, 1], addr.port())),
        lifetime,
        run,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serves_documents_assets_and_not_found_page() {
        let dir = data_dir();
        let supervisor =
            Supervisor::new(config(&dir, Duration::from_millis(10), 4), site::factory()).unwrap();
        let (addr, lifetime, run) = start(supervisor, PRIMARY_LISTENER).await;

        let response = reqwest::get(format!("http://{addr}/round1/")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers().get("X-Robots-Tag").unwrap(),
            "noindex, nofollow"
        );
        assert_eq!(response.text().await.unwrap(), "<h1>round 1</h1>");

        let response = reqwest::get(format!("http://{addr}/style.css")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let response = reqwest::get(format!("http://{addr}/round9/")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(response.text().await.unwrap(), "<h1>not found</h1>");

        lifetime.cancel(CancelReason::Signal);
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_admin_reload_picks_up_new_pages() {
        let dir = data_dir();
        let supervisor =
            Supervisor::new(config(&dir, Duration::from_millis(10), 4), site::factory()).unwrap();
        let (addr, lifetime, run) = start(supervisor, PRIMARY_LISTENER).await;
        let client = reqwest::Client::new();

        fs::write(dir.path().join("static/404.html"), "<h1>gone</h1>").unwrap();

        // Without the cookie the endpoint is indistinguishable from a missing page.
        let response = client
            .post(format!("http://{addr}/admin/reload"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

        let response = client
            .post(format!("http://{addr}/admin/reload"))
            .header(reqwest::header::COOKIE, format!("{ADMIN_COOKIE}=sesame"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body, serde_json::json!({}));

        let response = client
            .get(format!("http://{addr}/missing.html"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "<h1>gone</h1>");

        lifetime.cancel(CancelReason::Signal);
        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_full_shard_is_shed_and_waiters_finish_on_shutdown() {
        let dir = data_dir();
        // One slot and a start period far longer than the test: the first request waits.
        let supervisor =
            Supervisor::new(config(&dir, Duration::from_secs(3600), 1), site::factory()).unwrap();
        let (addr, lifetime, run) = start(supervisor, PRIMARY_LISTENER).await;

        let waiting = tokio::spawn(reqwest::get(format!("http://{addr}/round1/")));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let response = reqwest::get(format!("http://{addr}/round1/")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.text().await.unwrap(), "<h1>slow down</h1>");

        // Assets bypass admission.
        let response = reqwest::get(format!("http://{addr}/style.css")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        lifetime.cancel(CancelReason::Signal);
        let response = tokio::time::timeout(Duration::from_secs(3), waiting)
            .await
            .expect("waiting request should be released by shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        assert!(run.await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tls_listener_with_https_redirect() {
        let dir = data_dir();
        let (cert, key) = write_certificate(dir.path());
        let mut config = config(&dir, Duration::from_millis(10), 4);
        config.tls = ServerConfig::builder().tls(cert, key).build().tls;
        config.https_redirect = true;
        config.redirect_port = free_port();

        let supervisor = Supervisor::new(config, site::factory()).unwrap();
        let mut redirect = supervisor.subscribe_bound(REDIRECT_LISTENER).unwrap();
        let (addr, lifetime, run) = start(supervisor, PRIMARY_LISTENER).await;
        let redirect_port = redirect
            .wait_for(Option::is_some)
            .await
            .unwrap()
            .unwrap()
            .port();

        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        let response = client
            .get(format!("https://{addr}/style.css"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "body { color: red }");

        let response = client
            .get(format!("http://127.0.0.1:{redirect_port}/round1/?p=2"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(reqwest::header::LOCATION).unwrap(),
            &format!("https://127.0.0.1:{redirect_port}/round1/?p=2")
        );

        lifetime.cancel(CancelReason::Signal);
        assert!(run.await.unwrap().is_ok());
    }
}
