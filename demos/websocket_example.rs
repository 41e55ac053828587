use kucoin_link::core::kernel::WsConfig;
use kucoin_link::KucoinBuilder;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    price: String,
    best_bid: String,
    best_ask: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🚀 KuCoin Realtime Example");

    let ws_config = WsConfig::default()
        .with_ack_timeout(Duration::from_secs(5))
        .with_max_reconnect_attempts(3);
    let client = KucoinBuilder::new()
        .with_ws_config(ws_config)
        .connect_realtime(false)
        .await?;
    println!("🔗 Session state: {:?}", client.state());

    let mut tickers = client
        .subscribe("/market/ticker:BTC-USDT,ETH-USDT", false, true)
        .await?;
    let mut matches = client.subscribe("/market/match:BTC-USDT", false, false).await?;
    println!("📡 Subscribed: {:?}", client.active_topics().await?);

    let reader = tokio::spawn(async move {
        let mut count = 0;
        while let Some(message) = tickers.recv().await {
            match message {
                Ok(message) => match message.decode::<Ticker>() {
                    Ok(ticker) => println!(
                        "📊 {} last {} bid {} ask {}",
                        message.topic, ticker.price, ticker.best_bid, ticker.best_ask
                    ),
                    Err(e) => println!("⚠️  {}", e),
                },
                Err(e) => {
                    println!("❌ Stream error: {}", e);
                    if e.is_fatal() {
                        break;
                    }
                }
            }
            count += 1;
            if count >= 10 {
                break;
            }
        }
    });

    if let Some(Ok(trade)) = matches.recv().await {
        println!("💱 Trade: {}", trade.raw_data());
    }

    let _ = tokio::time::timeout(Duration::from_secs(30), reader).await;
    client.unsubscribe("/market/match:BTC-USDT").await?;
    sleep(Duration::from_millis(200)).await;

    client.stop().await;
    println!("🛑 Session state: {:?}", client.state());
    Ok(())
}
