use std::io::{self, BufRead, Write};

use furg_core::config::Config;
use furg_core::context::DynamicInputs;
use furg_core::router::{Cancellation, Request};
use furg_core::Core;
use tracing_subscriber::{fmt, EnvFilter};

/// A reference harness, not a production server: reads one message per
/// line from stdin, dispatches it through a single `Core` as a fixed
/// demo user, and prints the response. A real deployment puts an HTTP
/// layer in front of `Core::router` and sources `dynamic_inputs` from
/// the transaction/balance services instead of hardcoding them.
const DEMO_USER_ID: &str = "cli-demo-user";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = Config::from_env()?;
    let core = Core::new(config);

    tracing::info!("furg-core reference harness ready, reading messages from stdin");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "/quit" {
            break;
        }

        let request = Request {
            user_id: DEMO_USER_ID.to_string(),
            message: message.to_string(),
            profile: None,
            dynamic_inputs: DynamicInputs {
                visible_balance: 1_200.0,
                hidden_balance: 4_500.0,
                upcoming_bills_total_30d: 600.0,
                todays_spending: 42.0,
                last_transactions: vec![
                    "coffee $4.50".to_string(),
                    "groceries $63.10".to_string(),
                ],
            },
            life_context: None,
            history: None,
        };

        match core.router.dispatch(request, &Cancellation::new()).await {
            Ok(response) => {
                writeln!(
                    stdout,
                    "[{} | {:?} | ${:.4}] {}",
                    response.model_id, response.intent, response.cost_usd, response.text
                )?;
            }
            Err(err) => {
                writeln!(stdout, "refused: {err}")?;
            }
        }
    }

    Ok(())
}
