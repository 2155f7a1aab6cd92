use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;
use weather_mcp::client::Client;
use weather_mcp::transport::{
    decode_frame, encode_frame, format_sse_event, parse_sse_event, ClientInMemoryTransport,
    JsonRpcMessage, JsonRpcRequest,
};
use weather_mcp::weather::{self, build_server};

fn call_request() -> JsonRpcMessage {
    JsonRpcMessage::Request(JsonRpcRequest {
        id: 42,
        method: "tools/call".to_string(),
        params: Some(json!({
            "name": "get_weather",
            "arguments": {"city": "San Francisco"}
        })),
        ..Default::default()
    })
}

fn bench_frames(c: &mut Criterion) {
    let message = call_request();
    let frame = encode_frame(&message).unwrap();

    c.bench_function("encode_frame", |b| {
        b.iter(|| encode_frame(black_box(&message)).unwrap())
    });
    c.bench_function("decode_frame", |b| {
        b.iter(|| decode_frame(black_box(&frame)).unwrap())
    });
}

fn bench_sse_events(c: &mut Criterion) {
    let json = serde_json::to_string(&call_request()).unwrap();
    let event = format_sse_event("message", &json);

    c.bench_function("parse_sse_event", |b| {
        b.iter(|| parse_sse_event(black_box(&event)).unwrap())
    });
}

fn bench_in_memory_call(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let client = rt.block_on(async {
        let transport = ClientInMemoryTransport::new(|t| {
            tokio::spawn(async move {
                let server = build_server(t).unwrap();
                let _ = server.listen().await;
            })
        });
        Client::builder(transport).connect().await.unwrap()
    });

    c.bench_function("in_memory_call_tool", |b| {
        b.iter(|| {
            rt.block_on(client.call_tool(weather::TOOL_NAME, json!({"city": "Paris"})))
                .unwrap()
        })
    });

    rt.block_on(client.close()).unwrap();
}

criterion_group!(benches, bench_frames, bench_sse_events, bench_in_memory_call);
criterion_main!(benches);
