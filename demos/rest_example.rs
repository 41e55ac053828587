use kucoin_link::core::config::ConfigError;
use kucoin_link::exchanges::kucoin::{
    AccountType, AccountsParams, ListOrdersParams, Order, OrderStatus,
};
use kucoin_link::{KucoinBuilder, KucoinConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🚀 KuCoin REST Example");
    println!("======================");

    // Public endpoints need no credentials
    let public = KucoinBuilder::new().build_rest()?;
    println!("⏰ Server time: {}", public.server_time().await?);

    let config = match KucoinConfig::from_env("KUCOIN") {
        Ok(config) => config,
        Err(ConfigError::MissingEnvironmentVariable(var)) => {
            println!("⚠️  {} not set, skipping private endpoints", var);
            println!("💡 Set KUCOIN_API_KEY, KUCOIN_API_SECRET and KUCOIN_API_PASSPHRASE");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let rest = KucoinBuilder::new()
        .with_config(config)
        .with_rest_timeout(10)
        .build_rest()?;

    let params = AccountsParams::new().account_type(AccountType::Trade);
    for account in rest.accounts(&params).await? {
        println!(
            "💰 {}: available {} (holds {})",
            account.currency, account.available, account.holds
        );
    }

    let params = ListOrdersParams::new()
        .status(OrderStatus::Active)
        .page(1, 20)?;
    let page = rest.orders(&params).await?;
    let orders: Vec<Order> = page.items()?;
    println!(
        "📋 Active orders: {} on page {}/{}",
        orders.len(),
        page.current_page,
        page.total_page
    );
    for order in orders {
        println!(
            "   {} {} {} @ {}",
            order.symbol,
            order.side,
            order.size.unwrap_or_default(),
            order.price.unwrap_or_default()
        );
    }

    Ok(())
}
