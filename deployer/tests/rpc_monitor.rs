//! Integration tests for the node RPC client and the confirmation monitor
//!
//! These tests use a mock server to simulate the node's JSON-RPC responses.

use assert_matches::assert_matches;
use dex_deployer::{ConfirmationMonitor, ConfirmationWaiter, DeployConfig, DeployError, NodeRpcClient};
use serde_json::json;
use std::time::Duration;
use tokio_test::assert_ok;
use wiremock::{
    matchers::{body_partial_json, method},
    Mock, MockServer, ResponseTemplate,
};

/// Helper to create a config pointing at the mock node
fn create_test_config(rpc_url: String) -> DeployConfig {
    DeployConfig::default()
        .with_rpc_url(rpc_url)
        .with_max_retries(2)
        .with_retry_config(10, 50, 2.0)
        .with_tx_config(10, 2)
}

fn rpc_result(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "result": result
    }))
}

async fn mount_rpc(server: &MockServer, rpc_method: &str, result: serde_json::Value) {
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": rpc_method })))
        .respond_with(rpc_result(result))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_chain_id_and_block_number() {
    let mock_server = MockServer::start().await;
    mount_rpc(&mock_server, "eth_chainId", json!("0x7a69")).await;
    mount_rpc(&mock_server, "eth_blockNumber", json!("0x10")).await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    assert_eq!(assert_ok!(client.chain_id().await), 31337);
    assert_eq!(assert_ok!(client.block_number().await), 16);
    assert!(assert_ok!(client.health_check().await));
}

#[tokio::test]
async fn test_pending_receipt_is_none() {
    let mock_server = MockServer::start().await;
    mount_rpc(&mock_server, "eth_getTransactionReceipt", json!(null)).await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    assert!(client.transaction_receipt("0xabc").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reset_fork_sends_forking_params() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "method": "hardhat_reset",
            "params": [{
                "forking": {
                    "jsonRpcUrl": "https://rinkeby.example/rpc",
                    "blockNumber": 9000000
                }
            }]
        })))
        .respond_with(rpc_result(json!(true)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    client
        .reset_fork("https://rinkeby.example/rpc", Some(9_000_000))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_rpc_error_is_not_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32601, "message": "Method not found" }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    assert_matches!(
        client.reset_fork("https://rinkeby.example/rpc", None).await,
        Err(DeployError::RpcError(msg)) if msg.contains("Method not found")
    );
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    mount_rpc(&mock_server, "eth_chainId", json!("0x4")).await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    assert_eq!(client.chain_id().await.unwrap(), 4);
}

#[tokio::test]
async fn test_error_handling_and_retries() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&mock_server)
        .await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    assert_matches!(
        client.block_number().await,
        Err(DeployError::MaxRetriesExceeded(2))
    );
}

#[tokio::test]
async fn test_client_error_status_is_not_retried() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such route"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = NodeRpcClient::new(&create_test_config(mock_server.uri())).unwrap();
    assert_matches!(
        client.chain_id().await,
        Err(DeployError::HttpStatus { status: 404, message }) if message == "no such route"
    );
}

#[tokio::test]
async fn test_monitor_waits_for_confirmations() {
    let mock_server = MockServer::start().await;
    mount_rpc(
        &mock_server,
        "eth_getTransactionReceipt",
        json!({ "blockNumber": "0x10", "status": "0x1" }),
    )
    .await;
    // head is one block behind the required depth on the first poll
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "method": "eth_blockNumber" })))
        .respond_with(rpc_result(json!("0x11")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;
    mount_rpc(&mock_server, "eth_blockNumber", json!("0x12")).await;

    let config = create_test_config(mock_server.uri());
    let monitor = ConfirmationMonitor::new(NodeRpcClient::new(&config).unwrap(), &config);
    assert_ok!(monitor.wait("localhost", "0xabc", 3).await);
}

#[tokio::test]
async fn test_monitor_reports_revert() {
    let mock_server = MockServer::start().await;
    mount_rpc(
        &mock_server,
        "eth_getTransactionReceipt",
        json!({ "blockNumber": "0x10", "status": "0x0" }),
    )
    .await;

    let config = create_test_config(mock_server.uri());
    let monitor = ConfirmationMonitor::new(NodeRpcClient::new(&config).unwrap(), &config);
    assert_matches!(
        monitor.wait("localhost", "0xdead", 1).await,
        Err(DeployError::TransactionReverted(hash)) if hash == "0xdead"
    );
}

#[tokio::test]
async fn test_monitor_times_out_on_pending_transaction() {
    let mock_server = MockServer::start().await;
    mount_rpc(&mock_server, "eth_getTransactionReceipt", json!(null)).await;

    let config = create_test_config(mock_server.uri());
    let monitor = ConfirmationMonitor::new(NodeRpcClient::new(&config).unwrap(), &config)
        .with_poll_interval(Duration::from_millis(20))
        .with_timeout(Duration::from_millis(200));
    assert_matches!(
        monitor.wait("localhost", "0xabc", 1).await,
        Err(DeployError::TransactionTimeout(_))
    );
}

#[tokio::test]
async fn test_monitor_polls_the_network_of_the_transaction() {
    let layer1_node = MockServer::start().await;
    let layer2_node = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(rpc_result(json!(null)))
        .expect(0)
        .mount(&layer1_node)
        .await;
    mount_rpc(
        &layer2_node,
        "eth_getTransactionReceipt",
        json!({ "blockNumber": "0x20", "status": "0x1" }),
    )
    .await;
    mount_rpc(&layer2_node, "eth_blockNumber", json!("0x21")).await;

    let config = create_test_config(layer1_node.uri())
        .with_network_rpc_url("xdai", layer2_node.uri());
    let monitor = ConfirmationMonitor::from_config(&config)
        .unwrap()
        .with_timeout(Duration::from_secs(2));
    assert_ok!(monitor.wait("xdai", "0xabc", 2).await);
}
