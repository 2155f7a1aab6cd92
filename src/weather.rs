//! The `get_weather` tool and the server every run mode serves it from.

use crate::error::McpError;
use crate::server::{Server, ServerBuilder};
use crate::transport::Transport;
use crate::types::{CallToolRequest, CallToolResponse, Tool};
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};

pub const SERVER_NAME: &str = "weather-server";
pub const SERVER_VERSION: &str = "1.0.0";
pub const TOOL_NAME: &str = "get_weather";

#[derive(Debug, Deserialize)]
pub struct WeatherArgs {
    pub city: String,
}

/// There is no weather service behind this; every city gets the same forecast.
pub fn forecast(city: &str) -> String {
    format!("Weather in {}: Sunny, 25°C", city)
}

pub fn tool() -> Tool {
    Tool {
        name: TOOL_NAME.to_string(),
        description: Some("Get weather for a city".to_string()),
        input_schema: json!({
            "type": "object",
            "properties": {
                "city": {
                    "type": "string",
                    "description": "Name of the city"
                }
            },
            "required": ["city"]
        }),
    }
}

async fn get_weather(req: CallToolRequest) -> anyhow::Result<CallToolResponse> {
    let args = Value::Object(req.arguments.unwrap_or_default().into_iter().collect());
    let args: WeatherArgs =
        serde_json::from_value(args).context("missing or invalid argument `city`")?;
    Ok(CallToolResponse::text(forecast(&args.city)))
}

pub fn register<T: Transport>(builder: &mut ServerBuilder<T>) -> Result<(), McpError> {
    builder.register_tool(tool(), get_weather)
}

pub fn build_server<T: Transport>(t: T) -> Result<Server<T>, McpError> {
    let mut builder = Server::builder(t).name(SERVER_NAME).version(SERVER_VERSION);
    register(&mut builder)?;
    Ok(builder.build())
}
