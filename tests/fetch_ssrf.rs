//! Ambient-stack test (SPEC_FULL.md §1.1, §4.6): the SSRF guard against a
//! real loopback HTTP server started with `wiremock`, matching the teacher's
//! use of `wiremock` for fetch-boundary tests.

use potat_eval_server::fetch::{FetchClient, FetchOptions};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn blocks_a_literal_loopback_url_before_ever_touching_the_mock() {
    let mock_server = MockServer::start().await;
    // If the SSRF guard ever let this request through, this mock would be
    // hit; the assertion at the end proves it never was.
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let client = FetchClient::new(5, 2_000).unwrap();
    let result = client
        .fetch(&mock_server.uri(), FetchOptions::default(), &[])
        .await;

    assert!(result.is_err(), "expected the loopback fetch to be disallowed");
    mock_server.verify().await;
}

#[tokio::test]
async fn the_concurrency_cap_returns_429_without_issuing_a_request() {
    // A non-loopback, non-resolvable host exercises the concurrency gate
    // directly: with a cap of 0, every call must be rejected before any DNS
    // resolution or connection attempt happens.
    let client = FetchClient::new(0, 2_000).unwrap();
    let result = client
        .fetch("https://example.invalid/", FetchOptions::default(), &[])
        .await
        .unwrap();
    assert_eq!(result.status, 429);
}
