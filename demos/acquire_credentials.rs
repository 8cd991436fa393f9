//! Demonstrates acquiring single-use credentials through the default reqwest issuer and
//! attaching them to downstream lookup requests with [`BearerSigner`].

// crates.io
use color_eyre::Result;
use httpmock::prelude::*;
use url::Url;
// self
use lookup_broker::{
	broker::ReqwestBroker,
	config::{IssuerConfig, RuntimeMode},
	ext::{BearerSigner, sign_request},
	reqwest::Client,
};

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let server = MockServer::start_async().await;
	let token_mock = server
		.mock_async(|when, then| {
			when.method(POST).path("/api/auth/token").header("x-api-key", "demo-key");
			then.status(200)
				.header("content-type", "application/json")
				.body("{\"token\":\"demo-single-use\"}");
		})
		.await;
	let whois_mock = server
		.mock_async(|when, then| {
			when.method(GET)
				.path("/api/whois/example.com")
				.header("authorization", "Bearer demo-single-use");
			then.status(200).body("{\"registrar\":\"Example Registrar\"}");
		})
		.await;
	let config = IssuerConfig::builder(Url::parse(&server.base_url())?)
		.api_key("demo-key")
		.mode(RuntimeMode::Development)
		.build()?;
	let broker = ReqwestBroker::from_config(config)?;
	let client = Client::new();
	let request =
		sign_request(&broker, &BearerSigner, client.get(server.url("/api/whois/example.com")))
			.await?;
	let body = request.send().await?.error_for_status()?.text().await?;

	println!("WHOIS response: {body}.");
	println!("Broker state: {:?}.", broker.snapshot());

	token_mock.assert_async().await;
	whois_mock.assert_async().await;

	Ok(())
}
