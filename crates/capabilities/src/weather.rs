//! Current-conditions lookup backed by the OpenWeather API.

use std::future::Future;
use std::time::Duration;

use mcp::{ArgKind, ArgumentSchema, Arguments, PeerInfo, ToolDefinition, ToolFailure, ToolService};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::{CapabilityError, Result};

pub const DEFAULT_API_BASE: &str = "https://api.openweathermap.org/data/2.5/weather";

/// Current weather of one city.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentConditions {
    pub city: String,
    pub country: String,
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub wind_speed_ms: Option<f64>,
    pub description: String,
}

impl CurrentConditions {
    /// Extract conditions from an OpenWeather `weather` response.
    ///
    /// Missing fields fall back to placeholders instead of failing.
    pub fn from_openweather(data: &Value) -> Self {
        let text = |v: &Value, fallback: &str| v.as_str().unwrap_or(fallback).to_string();
        Self {
            city: text(&data["name"], "Unknown City"),
            country: text(&data["sys"]["country"], "Unknown Country"),
            temperature_c: data["main"]["temp"].as_f64(),
            humidity_pct: data["main"]["humidity"].as_f64(),
            wind_speed_ms: data["wind"]["speed"].as_f64(),
            description: text(&data["weather"][0]["description"], "Unknown"),
        }
    }

    /// Human-readable multi-line rendering.
    pub fn summary(&self) -> String {
        let or_na = |v: Option<f64>| v.map_or_else(|| "N/A".to_string(), |n| n.to_string());
        format!(
            "{}, {}\nTemperature: {}°C\nHumidity: {}%\nWind Speed: {} m/s\nWeather: {}",
            self.city,
            self.country,
            or_na(self.temperature_c),
            or_na(self.humidity_pct),
            or_na(self.wind_speed_ms),
            self.description,
        )
    }
}

/// Anything that can report current conditions for a city.
pub trait WeatherSource: Send + Sync + 'static {
    fn current(&self, city: &str) -> impl Future<Output = Result<CurrentConditions>> + Send;
}

#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub user_agent: String,
    /// OpenWeather unit system (`metric` gives °C and m/s).
    pub units: String,
    pub timeout: Duration,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            api_key: None,
            user_agent: concat!("toolhub/", env!("CARGO_PKG_VERSION")).to_string(),
            units: "metric".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP client for the OpenWeather current-weather endpoint.
pub struct OpenWeather {
    client: reqwest::Client,
    config: WeatherConfig,
}

impl OpenWeather {
    pub fn new(config: WeatherConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self { client, config })
    }
}

impl WeatherSource for OpenWeather {
    async fn current(&self, city: &str) -> Result<CurrentConditions> {
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            CapabilityError::Unavailable("weather API key is not configured".to_string())
        })?;

        let url = reqwest::Url::parse_with_params(
            &self.config.api_base,
            [
                ("q", city),
                ("appid", api_key),
                ("units", self.config.units.as_str()),
                ("lang", "en"),
            ],
        )
        .map_err(|e| CapabilityError::Unavailable(format!("invalid weather API base: {e}")))?;

        debug!(city, "requesting current weather");
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CapabilityError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let data: Value = response.json().await?;
        Ok(CurrentConditions::from_openweather(&data))
    }
}

/// Tool service exposing `query_weather`.
pub struct WeatherServer<S> {
    source: S,
}

impl<S: WeatherSource> WeatherServer<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: WeatherSource> ToolService for WeatherServer<S> {
    fn info(&self) -> PeerInfo {
        PeerInfo {
            name: "weather".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: "query_weather",
            description: "Current temperature, humidity, wind speed and conditions for a city. \
                          The city name must be in English, e.g. \"Taipei\" or \"New York\".",
            schema: ArgumentSchema::new().required(
                "city",
                ArgKind::String,
                "City name in English",
            ),
        }]
    }

    async fn call(&self, _tool: &str, arguments: Arguments) -> std::result::Result<Value, ToolFailure> {
        let city = arguments.str("city").unwrap_or_default().trim();
        if city.is_empty() {
            return Err(ToolFailure::invalid_arguments("city must not be empty"));
        }

        let conditions = self.source.current(city).await?;
        let summary = conditions.summary();
        Ok(json!({ "conditions": conditions, "summary": summary }))
    }
}
