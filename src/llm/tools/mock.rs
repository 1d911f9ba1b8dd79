//! Demo tools with canned or random results.

use super::ToolError;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;

const CONDITIONS: [&str; 5] = ["sunny", "cloudy", "rainy", "partly cloudy", "stormy"];

pub async fn get_random_number(_arguments: Value) -> Result<String, ToolError> {
    let number: u32 = rand::thread_rng().gen_range(1..=100);
    Ok(format!("Here's your random number: {}", number))
}

pub async fn calculate_fibonacci(arguments: Value) -> Result<String, ToolError> {
    // Models sometimes send numbers as strings
    let n = match &arguments["n"] {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| ToolError::InvalidParameters("Please provide a valid number.".to_string()))?;

    if !(1..=20).contains(&n) {
        return Err(ToolError::InvalidParameters(
            "Please provide a number between 1 and 20.".to_string(),
        ));
    }

    Ok(format!("The {}th Fibonacci number is {}", n, fibonacci(n as u32)))
}

fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 2..n {
        let next = a + b;
        a = b;
        b = next;
    }
    if n <= 2 {
        1
    } else {
        b
    }
}

pub async fn get_weather(arguments: Value) -> Result<String, ToolError> {
    let city = arguments["city"]
        .as_str()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ToolError::InvalidParameters("city is required".to_string()))?;

    let (condition, temperature) = {
        let mut rng = rand::thread_rng();
        let condition = CONDITIONS.choose(&mut rng).copied().unwrap_or("sunny");
        let temperature: i32 = rng.gen_range(15..35);
        (condition, temperature)
    };

    Ok(format!(
        "The weather in {} is currently {} with a temperature of {}°C",
        city, condition, temperature
    ))
}
