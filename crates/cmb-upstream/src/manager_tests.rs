use super::*;
use std::fs;
use std::sync::Mutex as TestMutex;

use cmb_config::UpstreamTransport;

fn stdio_config(name: &str, command: &str, args: Vec<String>) -> UpstreamServerConfig {
    UpstreamServerConfig {
        name: name.to_string(),
        transport: UpstreamTransport::Stdio { command: command.to_string(), args, env: HashMap::new() },
        oauth: false,
        max_retries: None,
    }
}

/// Minimal shell MCP server speaking JSON-RPC over stdio.
fn write_mock_script(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("mock-mcp.sh");
    fs::write(
        &path,
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"mock","version":"0.1.0"}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo-tool","description":"echo back","inputSchema":{"type":"object","properties":{"value":{"type":"string"}}}}]}}\n' "$id"
      ;;
    *\"tools/call\"*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id"
      ;;
  esac
done
"#,
    )
    .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    path
}

/// Like the mock above, but the first two invocations exit immediately.
fn write_flaky_script(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let counter = dir.join("attempts");
    let path = dir.join("flaky-mcp.sh");
    fs::write(
        &path,
        format!(
            r#"#!/bin/sh
counter="{counter}"
n=$(cat "$counter" 2>/dev/null || echo 0)
n=$((n+1))
echo "$n" > "$counter"
if [ "$n" -le 2 ]; then exit 1; fi
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"flaky","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"tools/list\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[]}}}}\n' "$id"
      ;;
  esac
done
"#,
            counter = counter.display()
        ),
    )
    .unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
    }

    (path, counter)
}

#[derive(Default)]
struct RecordingSink {
    events: TestMutex<Vec<String>>,
}

impl ToolRegistrySink for RecordingSink {
    fn tools_changed(&self, namespace: &str, tools: Vec<ToolDescriptor>) {
        self.events
            .lock()
            .unwrap()
            .push(format!("changed:{namespace}:{}", tools.len()));
    }

    fn namespace_removed(&self, namespace: &str) {
        self.events.lock().unwrap().push(format!("removed:{namespace}"));
    }
}

fn virtual_tool(name: &str, description: &str) -> ToolDescriptor {
    let execute: HostCallable =
        Arc::new(|_args| Box::pin(async move { Ok(json!("virtual result")) }));
    ToolDescriptor {
        name: sanitize_name(name),
        upstream_name: name.to_string(),
        description: description.to_string(),
        raw_schema: json!({"type": "object"}),
        input_schema: json!({"type": "object"}),
        output_schema: None,
        execute,
    }
}

#[test]
fn oauth_classification_requires_enabled_server_and_matching_message() {
    assert!(is_oauth_failure(true, "OAuth token expired"));
    assert!(is_oauth_failure(true, "authorization timeout after 120s"));
    assert!(is_oauth_failure(true, "Authorization Timeout"));
    assert!(!is_oauth_failure(true, "connection refused"));
    assert!(!is_oauth_failure(false, "OAuth token expired"));
}

#[test]
fn retry_delays_are_monotone_and_capped() {
    let mut previous = 0;
    for attempt in 0..12 {
        let delay = retry_delay_base_ms(attempt);
        assert!(delay >= previous, "delay decreased at attempt {attempt}");
        assert!(delay <= RETRY_DELAY_CAP_MS);
        previous = delay;
    }
    assert_eq!(retry_delay_base_ms(0), 1000);
    assert_eq!(retry_delay_base_ms(1), 2000);
    assert_eq!(retry_delay_base_ms(2), 4000);
    assert_eq!(retry_delay_base_ms(10), RETRY_DELAY_CAP_MS);
}

#[tokio::test]
async fn register_server_installs_virtual_tools() {
    let manager = UpstreamManager::new();
    manager.register_server("utils", vec![virtual_tool("base64-encode", "encode bytes")]);

    let list = manager.get_tool_list(None);
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].name, "utils__base64encode");
    assert_eq!(list[0].server, "utils");

    let descriptor = manager.get_tool_by_name("utils__base64encode").unwrap();
    let result = (descriptor.execute)(vec![json!({})]).await.unwrap();
    assert_eq!(result, json!("virtual result"));

    let states = manager.get_connection_states();
    assert_eq!(states["utils"].state, ServerConnectionState::Connected);
}

#[tokio::test]
async fn sinks_observe_registration_and_removal() {
    let manager = UpstreamManager::new();
    let sink = Arc::new(RecordingSink::default());
    manager.add_sink(sink.clone());

    manager.register_server("virt", vec![virtual_tool("a", ""), virtual_tool("b", "")]);
    manager.disconnect_server("virt").await;

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(events, vec!["changed:virt:2", "removed:virt"]);
}

#[tokio::test]
async fn tool_list_filter_restricts_to_one_server() {
    let manager = UpstreamManager::new();
    manager.register_server("alpha", vec![virtual_tool("one", "")]);
    manager.register_server("beta", vec![virtual_tool("two", "")]);

    assert_eq!(manager.get_tool_list(None).len(), 2);
    let filtered = manager.get_tool_list(Some("beta"));
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "beta__two");
}

#[tokio::test]
async fn connect_server_registers_and_proxies_tools() {
    let temp = tempfile::tempdir().unwrap();
    let script = write_mock_script(temp.path());
    let manager = UpstreamManager::new();
    let config =
        stdio_config("mock", "sh", vec![script.to_string_lossy().into_owned()]);

    assert!(manager.connect_server("mock", config).await);

    let states = manager.get_connection_states();
    assert_eq!(states["mock"].state, ServerConnectionState::Connected);

    // The dash is sanitized out of the qualified name.
    let descriptor = manager.get_tool_by_name("mock__echotool").unwrap();
    assert_eq!(descriptor.upstream_name, "echo-tool");
    let result = (descriptor.execute)(vec![json!({"value": "ping"})]).await.unwrap();
    assert_eq!(
        result["content"][0]["text"],
        json!("pong"),
        "unexpected proxy result: {result}"
    );

    manager.disconnect_server("mock").await;
    assert!(manager.get_tool_by_name("mock__echotool").is_none());
}

#[tokio::test]
async fn failing_connect_returns_false_and_records_failure() {
    let manager = UpstreamManager::new();
    let config = stdio_config("broken", "/nonexistent/mcp-server", vec![]);

    assert!(!manager.connect_server("broken", config).await);

    let states = manager.get_connection_states();
    assert_eq!(states["broken"].state, ServerConnectionState::Failed);
    assert!(states["broken"].last_error.is_some());
}

#[tokio::test]
async fn background_connect_with_single_attempt_fails_terminally() {
    let manager = UpstreamManager::new();
    let mut config = stdio_config("dead", "/nonexistent/mcp-server", vec![]);
    config.max_retries = Some(1);

    manager.connect_server_in_background("dead", config, None);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let states = manager.get_connection_states();
        if states.get("dead").map(|info| info.state) == Some(ServerConnectionState::Failed) {
            assert!(states["dead"].last_error.as_deref().unwrap().contains("1 attempt"));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "server never reached failed state");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn oauth_failure_short_circuits_background_retries() {
    let manager = UpstreamManager::new();
    // The spawn fails immediately with a message that matches the OAuth
    // heuristic only because the command path contains "oauth".
    let mut config = stdio_config("authy", "/nonexistent/oauth-helper", vec![]);
    config.oauth = true;
    config.max_retries = Some(5);

    manager.connect_server_in_background("authy", config, None);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let states = manager.get_connection_states();
        if states.get("authy").map(|info| info.state) == Some(ServerConnectionState::AwaitingAuth) {
            assert_eq!(states["authy"].last_error.as_deref(), Some(OAUTH_REQUIRED_ERROR));
            assert_eq!(states["authy"].attempt, 1, "oauth failure must not retry");
            break;
        }
        assert!(std::time::Instant::now() < deadline, "server never reached awaiting-auth");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn background_retry_eventually_connects_flaky_server() {
    let temp = tempfile::tempdir().unwrap();
    let (script, counter) = write_flaky_script(temp.path());
    let manager = UpstreamManager::new();
    let mut config =
        stdio_config("flaky", "sh", vec![script.to_string_lossy().into_owned()]);
    config.max_retries = Some(5);

    let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();
    let connected_tx = std::sync::Mutex::new(Some(connected_tx));
    manager.connect_server_in_background(
        "flaky",
        config,
        Some(Box::new(move || {
            if let Some(tx) = connected_tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
            Ok(())
        })),
    );

    // Two failures back off roughly 1s and 2s (plus jitter) before the
    // third attempt succeeds.
    tokio::time::timeout(Duration::from_secs(15), connected_rx)
        .await
        .expect("flaky server never connected")
        .unwrap();

    let states = manager.get_connection_states();
    assert_eq!(states["flaky"].state, ServerConnectionState::Connected);
    let attempts: u32 = fs::read_to_string(&counter).unwrap().trim().parse().unwrap();
    assert_eq!(attempts, 3);

    manager.disconnect_all().await;
}

#[tokio::test]
async fn reissued_background_connect_cancels_pending_retry() {
    let manager = UpstreamManager::new();
    let mut config = stdio_config("wobbly", "/nonexistent/mcp-server", vec![]);
    config.max_retries = Some(5);

    manager.connect_server_in_background("wobbly", config.clone(), None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reissue with a single attempt; the first task's pending retry must be
    // cancelled so the terminal state comes from the second task.
    config.max_retries = Some(1);
    manager.connect_server_in_background("wobbly", config, None);

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let states = manager.get_connection_states();
        if states.get("wobbly").map(|info| info.state) == Some(ServerConnectionState::Failed) {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "server never reached failed state");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
