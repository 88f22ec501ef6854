// Copyright (C) 2024, 2025 MVSPool Developers (see AUTHORS)
//
// This file is part of MVSPool
//
// MVSPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// MVSPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// MVSPool. If not, see <https://www.gnu.org/licenses/>.

use crate::UpstreamClient;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Starts a wiremock server and a client pointed at it with the test
/// account/password pair used by the method mocks below.
pub async fn setup_mock_upstream() -> (MockServer, UpstreamClient) {
    let mock_server = MockServer::start().await;
    let client = UpstreamClient::new(
        "test-node",
        &mock_server.uri(),
        "pool",
        "secret",
        Duration::from_secs(5),
    )
    .expect("client should build");
    (mock_server, client)
}

/// Mounts a successful JSON-RPC reply for one method with exact params.
pub async fn mock_method(
    mock_server: &MockServer,
    api_method: &str,
    params: serde_json::Value,
    result: serde_json::Value,
) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(body_json(serde_json::json!({
            "jsonrpc": "2.0",
            "method": api_method,
            "params": params,
            "id": 0
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": result,
            "error": null,
            "id": 0
        })))
        .mount(mock_server)
        .await;
}

/// Mounts a structured JSON-RPC error reply for one method, any params.
pub async fn mock_error_method(mock_server: &MockServer, api_method: &str, code: i64, msg: &str) {
    Mock::given(method("POST"))
        .and(path("/"))
        .and(wiremock::matchers::body_partial_json(serde_json::json!({
            "method": api_method
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "result": null,
            "error": {"code": code, "message": msg},
            "id": 0
        })))
        .mount(mock_server)
        .await;
}
