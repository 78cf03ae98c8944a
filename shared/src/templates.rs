//! Renders user strategy code into the runner program executed inside a
//! sandbox: a broker-client preamble, then the user code wrapped in a guard
//! that turns any exception into a captured output line.
//!
//! Credential values never appear in the rendered source. The preamble reads
//! them from environment variables injected into the container, so hostile
//! credential content cannot alter the generated program.

use askama::Template;

use crate::models::BrokerKind;

/// One indentation unit applied to every line of user code inside the guard.
pub const INDENT_UNIT: &str = "    ";

#[derive(Template)]
#[template(path = "strategy_runner.py", escape = "none")]
struct StrategyTemplate {
    client_setup: &'static str,
    user_code: String,
}

/// Render the final runner source for `user_code` against `broker`.
///
/// Pure: the same (code, broker) pair always yields the same text.
pub fn render_strategy(user_code: &str, broker: BrokerKind) -> Result<String, askama::Error> {
    StrategyTemplate {
        client_setup: client_setup(broker),
        user_code: indent(user_code),
    }
    .render()
}

fn client_setup(broker: BrokerKind) -> &'static str {
    match broker {
        BrokerKind::Dhan => {
            "from Tradehull_V2 import Tradehull\n\
             client_code = os.environ[\"ALGORUN_CLIENT_ID\"]\n\
             token_id = os.environ[\"ALGORUN_ACCESS_TOKEN\"]\n\
             tsl = Tradehull(client_code, token_id)"
        }
        BrokerKind::Zerodha => {
            "from kiteconnect import KiteConnect\n\
             kite = KiteConnect(api_key=os.environ[\"ALGORUN_CLIENT_ID\"])\n\
             kite.set_access_token(os.environ[\"ALGORUN_ACCESS_TOKEN\"])"
        }
        BrokerKind::Upstox => {
            "import upstox_client\n\
             configuration = upstox_client.Configuration()\n\
             configuration.access_token = os.environ[\"ALGORUN_ACCESS_TOKEN\"]\n\
             upstox = upstox_client.ApiClient(configuration)"
        }
        BrokerKind::AngelOne => {
            "from SmartApi import SmartConnect\n\
             smart = SmartConnect(api_key=os.environ[\"ALGORUN_CLIENT_ID\"])\n\
             smart.setAccessToken(os.environ[\"ALGORUN_ACCESS_TOKEN\"])"
        }
    }
}

/// Prefix every line (empty ones included) with one indent unit so the body
/// sits inside the `try:` block.
fn indent(code: &str) -> String {
    code.lines()
        .map(|line| format!("{}{}", INDENT_UNIT, line))
        .collect::<Vec<_>>()
        .join("\n")
}
