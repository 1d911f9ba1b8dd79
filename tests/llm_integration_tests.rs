//! Live agent runs against Groq. Ignored unless built with `test-api`.

use futures_util::StreamExt;
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voice_agent_rs::{
    agent::{AgentCapability, AgentEvent},
    config::ApiConfig,
    llm::{create_chat_model, create_default_registry, LlmConfig, LlmProvider, ToolCallingAgent},
};

fn groq_agent() -> Option<ToolCallingAgent> {
    if env::var("GROQ_API_KEY").is_err() {
        println!("GROQ_API_KEY not set, skipping integration test");
        return None;
    }
    let api = ApiConfig::load(LlmProvider::Groq).expect("Failed to load config");
    let config = LlmConfig {
        temperature: 0.0,
        ..LlmConfig::default()
    };
    let model = create_chat_model(&config, &api).expect("Failed to create chat model");
    Some(ToolCallingAgent::new(model, create_default_registry()))
}

#[tokio::test]
#[cfg_attr(
    not(feature = "test-api"),
    ignore = "requires API key - run with --features test-api"
)]
async fn test_plain_answer_streams_tokens() {
    let Some(agent) = groq_agent() else {
        return;
    };

    let mut stream = agent.stream(
        "Reply with one short sentence greeting me.",
        &[],
        CancellationToken::new(),
    );
    let mut tokens = Vec::new();
    while let Some(event) = stream.next().await {
        if let AgentEvent::Token(token) = event.expect("agent failed") {
            tokens.push(token);
        }
    }
    println!("Response: {}", tokens.concat());
    assert!(!tokens.is_empty());
}

#[tokio::test]
#[cfg_attr(
    not(feature = "test-api"),
    ignore = "requires API key - run with --features test-api"
)]
async fn test_tool_call_round_trip() {
    let Some(agent) = groq_agent() else {
        return;
    };

    let mut stream = agent.stream(
        "What is the 10th Fibonacci number? Use your tool.",
        &[],
        CancellationToken::new(),
    );
    let mut tools = Vec::new();
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event.expect("agent failed") {
            AgentEvent::ToolStart { name } => tools.push(name),
            AgentEvent::Token(token) => text.push_str(&token),
        }
    }
    println!("Tools: {:?}, response: {}", tools, text);
    assert!(tools.iter().any(|t| t == "calculate_fibonacci"));
    assert!(text.contains("55"));
}

#[tokio::test]
#[cfg_attr(
    not(feature = "test-api"),
    ignore = "requires API key - run with --features test-api"
)]
async fn test_cancel_stops_the_stream() {
    let Some(agent) = groq_agent() else {
        return;
    };
    let agent: Arc<dyn AgentCapability> = Arc::new(agent);

    let cancel = CancellationToken::new();
    let mut stream = agent.stream("Tell me a long story about a lighthouse.", &[], cancel.clone());
    let first = stream.next().await;
    assert!(matches!(first, Some(Ok(_))));

    cancel.cancel();
    let rest = tokio::time::timeout(Duration::from_secs(5), async {
        let mut count = 0usize;
        while stream.next().await.is_some() {
            count += 1;
        }
        count
    })
    .await
    .expect("stream kept running after cancel");
    // Anything already buffered may still drain, but the stream must end
    println!("{} events after cancel", rest);
}
