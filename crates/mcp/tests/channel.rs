use std::time::Duration;

use mcp::{
    ArgKind, ArgumentSchema, Arguments, Channel, ErrorKind, PeerInfo, ResourceDescriptor,
    ToolCallRequest, ToolDefinition, ToolFailure, ToolServer, ToolService,
};
use serde_json::{Map, Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Greeter;

impl ToolService for Greeter {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            name: "greeter".to_string(),
            version: Some("test".to_string()),
        }
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "greet",
            description: "Say hello",
            schema: ArgumentSchema::new().required("name", ArgKind::String, "Who to greet"),
        }]
    }

    async fn call(&self, _tool: &str, arguments: Arguments) -> Result<Value, ToolFailure> {
        match arguments.str("name") {
            Some("nobody") => Err(ToolFailure::capability("nobody is home")),
            Some(name) => Ok(json!({ "greeting": format!("hello, {name}") })),
            None => Err(ToolFailure::invalid_arguments("name missing")),
        }
    }

    fn resources(&self) -> Vec<ResourceDescriptor> {
        vec![ResourceDescriptor {
            uri: "greeter://readme".to_string(),
            name: "readme".to_string(),
            description: None,
            mime_type: Some("text/plain".to_string()),
        }]
    }

    async fn read_resource(&self, uri: &str) -> Result<String, ToolFailure> {
        match uri {
            "greeter://readme" => Ok("call greet".to_string()),
            other => Err(ToolFailure::invalid_arguments(format!("unknown resource: {other}"))),
        }
    }
}

async fn spawn_server() -> (std::net::SocketAddr, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        ToolServer::new(Greeter)
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    (addr, tx)
}

fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

#[tokio::test]
async fn discover_and_invoke_over_tcp() {
    let (addr, _shutdown) = spawn_server().await;

    let channel = Channel::connect("greeter", addr, Duration::from_secs(2))
        .await
        .unwrap();
    channel.initialize().await.unwrap();

    let info = channel.server_info().await.unwrap();
    assert_eq!(info.server_info.name, "greeter");
    assert!(info.capabilities.resources);

    let tools = channel.tools().await;
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].tool_name, "greet");

    let bad = channel
        .call_tool(ToolCallRequest::new("greet", Map::new()))
        .await
        .unwrap();
    assert_eq!(bad.error_kind, Some(ErrorKind::InvalidArguments));

    let failed = channel
        .call_tool(ToolCallRequest::new("greet", args(json!({"name": "nobody"}))))
        .await
        .unwrap();
    assert_eq!(failed.error_kind, Some(ErrorKind::CapabilityExecution));

    let ok = channel
        .call_tool(ToolCallRequest::new("greet", args(json!({"name": "ada"}))))
        .await
        .unwrap();
    assert!(ok.success);
    assert_eq!(ok.payload, Some(json!({"greeting": "hello, ada"})));

    channel.ping().await.unwrap();
}

#[tokio::test]
async fn resources_are_listed_and_read() {
    let (addr, _shutdown) = spawn_server().await;
    let channel = Channel::connect("greeter", addr, Duration::from_secs(2))
        .await
        .unwrap();
    channel.initialize().await.unwrap();

    let resources = channel.list_resources().await.unwrap();
    assert_eq!(resources[0].uri, "greeter://readme");
    assert_eq!(channel.read_resource("greeter://readme").await.unwrap(), "call greet");
    assert!(channel.read_resource("greeter://other").await.is_err());
}

#[tokio::test]
async fn dropping_a_channel_leaves_server_running() {
    let (addr, _shutdown) = spawn_server().await;

    let first = Channel::connect("greeter", addr, Duration::from_secs(2))
        .await
        .unwrap();
    first.initialize().await.unwrap();
    drop(first);

    let second = Channel::connect("greeter", addr, Duration::from_secs(2))
        .await
        .unwrap();
    second.initialize().await.unwrap();
    second.ping().await.unwrap();
}

#[tokio::test]
async fn call_before_initialize_is_rejected() {
    let (addr, _shutdown) = spawn_server().await;
    let channel = Channel::connect("greeter", addr, Duration::from_secs(2))
        .await
        .unwrap();
    let err = channel
        .call_tool(ToolCallRequest::new("greet", Map::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, mcp::Error::NotInitialized));
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = Channel::connect("gone", addr, Duration::from_secs(2)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn response_split_across_a_timeout_is_not_corrupted() {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Answers the first request in two halves with a pause longer than the
    // client timeout, then answers the second request normally.
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        lines.next_line().await.unwrap().unwrap();
        write_half
            .write_all(br#"{"jsonrpc":"2.0","id":1,"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(450)).await;
        write_half.write_all(b"\"result\":{}}\n").await.unwrap();

        let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": second["id"], "result": {}});
        write_half
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();
        let _ = lines.next_line().await;
    });

    let channel = Channel::connect("slow", addr, Duration::from_secs(2))
        .await
        .unwrap()
        .with_timeout(Duration::from_millis(300));

    let err = channel.ping().await.unwrap_err();
    assert!(matches!(err, mcp::Error::Timeout));

    channel.ping().await.unwrap();
}
