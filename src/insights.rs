use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::report::RunSummary;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyInsights {
    pub strategy: String,
    pub symbol: String,
    pub trading_notes: Vec<String>,
    pub risk_assessment: String,
    pub execution_recommendations: Vec<String>,
    pub market_context: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StrategyInsightsResponse {
    pub trading_notes: Vec<String>,
    pub risk_assessment: String,
    pub execution_recommendations: Vec<String>,
    pub market_context: String,
}

/// Generate AI-powered commentary for one strategy run.
pub async fn generate_strategy_insights(run: &RunSummary) -> Result<StrategyInsights> {
    let api_key = match env::var("OPENAI_API_KEY") {
        Ok(key) => key,
        Err(_) => {
            println!(
                "⚠️  OPENAI_API_KEY not set, using fallback analysis for {}",
                run.strategy
            );
            return Ok(generate_fallback_insights(run));
        }
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let prompt = format!(
        r#"You are a quantitative trading analyst reviewing backtest results for a rules-based crypto strategy. Analyze this run and provide actionable insights.

STRATEGY: {} on {}
BACKTEST METRICS:
- Total Return: {:.2}%
- Buy & Hold Return: {:.2}%
- Sharpe Ratio: {:.2}
- Win Rate: {:.1}%
- Max Drawdown: {:.2}%
- Profit Factor: {:.2}
- Trades: {}
- Exposure: {:.1}%

Please provide:
1. 3-5 specific trading notes (execution tips, market conditions, risk factors)
2. Risk assessment (1-2 sentences on risk level and key concerns)
3. 2-3 execution recommendations (entry/exit strategies, position sizing)
4. Market context (1-2 sentences on when this strategy profile works)

IMPORTANT: Respond with ONLY valid JSON in this exact format (no markdown, no explanations, no code blocks):
{{
  "trading_notes": ["note1", "note2", "note3"],
  "risk_assessment": "brief risk summary",
  "execution_recommendations": ["rec1", "rec2"],
  "market_context": "market outlook"
}}"#,
        run.strategy,
        run.symbol,
        run.return_pct,
        run.buy_hold_return_pct,
        run.sharpe,
        run.win_rate_pct,
        run.max_drawdown_pct,
        run.profit_factor,
        run.n_trades,
        run.exposure_pct
    );

    let request_body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [
            {
                "role": "user",
                "content": prompt
            }
        ],
        "temperature": 0.7,
        "max_tokens": 1000
    });

    let response = client
        .post("https://api.openai.com/v1/chat/completions")
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&request_body)
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        println!(
            "⚠️  OpenAI API error for {}: {}. Using fallback analysis.",
            run.strategy, error_text
        );
        return Ok(generate_fallback_insights(run));
    }

    let response_json: serde_json::Value = response.json().await?;

    let choices = response_json["choices"]
        .as_array()
        .ok_or_else(|| anyhow::anyhow!("Invalid response structure: no choices array"))?;
    if choices.is_empty() {
        return Err(anyhow::anyhow!("No choices in OpenAI response"));
    }

    let content = choices[0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("No content in OpenAI response"))?;

    if content.trim().is_empty() {
        println!(
            "⚠️  Empty OpenAI response for {}. Using fallback analysis.",
            run.strategy
        );
        return Ok(generate_fallback_insights(run));
    }

    let json_content = strip_code_fences(content);

    match serde_json::from_str::<StrategyInsightsResponse>(json_content) {
        Ok(parsed) => Ok(StrategyInsights {
            strategy: run.strategy.clone(),
            symbol: run.symbol.clone(),
            trading_notes: parsed.trading_notes,
            risk_assessment: parsed.risk_assessment,
            execution_recommendations: parsed.execution_recommendations,
            market_context: parsed.market_context,
        }),
        Err(e) => {
            println!(
                "⚠️  Failed to parse OpenAI response for {}: {}. Raw content: '{}'. Using fallback analysis.",
                run.strategy, e, json_content
            );
            Ok(generate_fallback_insights(run))
        }
    }
}

/// Portfolio-level commentary across all saved runs.
pub async fn generate_portfolio_insights(
    total_runs: usize,
    profitable_runs: usize,
    avg_return: f64,
    avg_sharpe: f64,
    avg_win_rate: f64,
    top_performers: Vec<(String, f64)>,
) -> Result<String> {
    let fallback = || {
        let success_rate = (profitable_runs as f64 / total_runs.max(1) as f64) * 100.0;
        format!(
            "Portfolio Analysis: {} profitable runs out of {} total ({:.1}% success rate). \
             Average return: {:.1}%, Average Sharpe: {:.2}, Average win rate: {:.1}%. \
             Favor the strategies that beat buy-and-hold with contained drawdowns.",
            profitable_runs, total_runs, success_rate, avg_return, avg_sharpe, avg_win_rate
        )
    };

    let api_key = match env::var("OPENAI_API_KEY") {
        Ok(key) => key,
        Err(_) => return Ok(fallback()),
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let top_performers_str = top_performers
        .iter()
        .take(5)
        .map(|(name, return_pct)| format!("{}: {:.1}%", name, return_pct))
        .collect::<Vec<_>>()
        .join(", ");

    let prompt = format!(
        r#"You are a quantitative portfolio manager reviewing a suite of rules-based crypto backtests. Analyze this performance and provide insights.

PORTFOLIO METRICS:
- Total Runs: {}
- Profitable Runs: {} ({:.1}%)
- Average Return (Profitable): {:.1}%
- Average Sharpe Ratio: {:.2}
- Average Win Rate: {:.1}%

TOP PERFORMERS: {}

Provide a 2-3 paragraph analysis covering:
1. Overall strategy-suite effectiveness
2. Key themes in the top performers
3. Risk management recommendations
4. Which strategy profiles deserve more capital

Be specific and actionable for a quantitative trader."#,
        total_runs,
        profitable_runs,
        (profitable_runs as f64 / total_runs.max(1) as f64) * 100.0,
        avg_return,
        avg_sharpe,
        avg_win_rate,
        top_performers_str
    );

    let request_body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [
            {
                "role": "user",
                "content": prompt
            }
        ],
        "temperature": 0.8,
        "max_tokens": 800
    });

    let response = client
        .post("https://api.openai.com/v1/chat/completions")
        .header("Authorization", format!("Bearer {}", api_key))
        .header("Content-Type", "application/json")
        .json(&request_body)
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        println!(
            "⚠️  OpenAI API error for portfolio analysis: {}. Using fallback analysis.",
            error_text
        );
        return Ok(fallback());
    }

    let response_json: serde_json::Value = response.json().await?;
    let content = response_json["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("No content in OpenAI response"))?;

    Ok(content.to_string())
}

/// Models often wrap JSON in markdown code fences despite instructions.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if trimmed.starts_with("```json") {
        let start = content.find("```json").unwrap_or(0) + 7;
        let end = content.rfind("```").unwrap_or(content.len());
        content[start..end].trim()
    } else if trimmed.starts_with("```") {
        let start = content.find("```").unwrap_or(0) + 3;
        let end = content.rfind("```").unwrap_or(content.len());
        content[start..end].trim()
    } else {
        trimmed
    }
}

/// Deterministic commentary when the API is unavailable.
pub fn generate_fallback_insights(run: &RunSummary) -> StrategyInsights {
    let mut trading_notes = Vec::new();
    let risk_assessment;
    let mut execution_recommendations = Vec::new();

    if run.return_pct > 100.0 {
        trading_notes.push("Strong momentum capture - monitor for regime change".to_string());
        risk_assessment = "High return with meaningful volatility risk".to_string();
    } else if run.return_pct > 10.0 {
        trading_notes
            .push("Solid performance - suitable for core portfolio allocation".to_string());
        risk_assessment = "Moderate risk with good return potential".to_string();
    } else if run.return_pct > 0.0 {
        trading_notes.push("Conservative performance - consider for risk management".to_string());
        risk_assessment = "Low risk, modest returns".to_string();
    } else {
        trading_notes
            .push("Negative expectancy in this window - re-examine entry criteria".to_string());
        risk_assessment = "Strategy lost money over the tested period".to_string();
    }

    if run.sharpe > 2.0 {
        trading_notes.push("Excellent risk-adjusted returns - increase position size".to_string());
        execution_recommendations
            .push("Consider larger position size due to high Sharpe ratio".to_string());
    } else if run.sharpe > 1.0 {
        trading_notes.push("Good risk-adjusted performance - maintain current sizing".to_string());
        execution_recommendations.push("Standard position sizing appropriate".to_string());
    } else {
        trading_notes
            .push("Lower risk-adjusted returns - consider reducing position size".to_string());
        execution_recommendations
            .push("Consider smaller position size due to lower Sharpe ratio".to_string());
    }

    if run.win_rate_pct > 80.0 {
        trading_notes.push("High win rate suggests strong signal quality".to_string());
    } else if run.win_rate_pct < 50.0 {
        trading_notes
            .push("Low win rate - review entry criteria and market conditions".to_string());
    }

    if run.max_drawdown_pct > 20.0 {
        trading_notes.push("High drawdown risk - implement strict stop losses".to_string());
        execution_recommendations
            .push("Use tighter stop losses to manage drawdown risk".to_string());
    }

    if run.return_pct < run.buy_hold_return_pct {
        trading_notes.push("Underperformed buy-and-hold over this window".to_string());
    }

    StrategyInsights {
        strategy: run.strategy.clone(),
        symbol: run.symbol.clone(),
        trading_notes,
        risk_assessment,
        execution_recommendations,
        market_context: "Market analysis unavailable - using fallback metrics".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(ret: f64, sharpe: f64, win: f64, dd: f64) -> RunSummary {
        RunSummary {
            strategy: "macd_crossover".to_string(),
            symbol: "SOL".to_string(),
            return_pct: ret,
            buy_hold_return_pct: 5.0,
            max_drawdown_pct: dd,
            sharpe,
            win_rate_pct: win,
            profit_factor: 1.4,
            n_trades: 25,
            equity_final: 110_000.0,
            exposure_pct: 35.0,
        }
    }

    #[test]
    fn fallback_flags_drawdown_and_losses() {
        let insights = generate_fallback_insights(&run(-3.0, 0.4, 42.0, 28.0));
        assert!(insights.risk_assessment.contains("lost money"));
        assert!(
            insights
                .trading_notes
                .iter()
                .any(|n| n.contains("drawdown"))
        );
        assert!(!insights.execution_recommendations.is_empty());
    }

    #[test]
    fn strips_json_code_fences() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(fenced), "{\"a\": 1}");
        let bare = "  {\"a\": 1}  ";
        assert_eq!(strip_code_fences(bare), "{\"a\": 1}");
        let plain_fence = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(plain_fence), "{\"a\": 1}");
    }
}
