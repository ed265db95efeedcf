use anyhow::{Context, bail};
use chrono::{Duration, Utc};
use clap::Parser;
use reqwest::Client;
use serde_json::{Value, json};

/// Plays one removal scenario against a running server: a donor lists food, two
/// receivers claim it, a deliverer picks up the second claim and the donor
/// removes the listing.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:8080")]
    url: String,

    #[arg(long, default_value_t = 1)]
    donor: i64,

    #[arg(long, default_value_t = 21)]
    first_receiver: i64,

    #[arg(long, default_value_t = 22)]
    second_receiver: i64,

    #[arg(long, default_value_t = 31)]
    deliverer: i64,

    /// Units on the listing; needs `CAPACITY_POLICY=per_unit` on the server to
    /// admit both receivers
    #[arg(long, default_value_t = 2)]
    quantity: u32,
}

struct Session<'a> {
    client: &'a Client,
    base: &'a str,
}

impl Session<'_> {
    async fn call(&self, route: &str, actor: (i64, &str), body: Value) -> anyhow::Result<Value> {
        let response = self
            .client
            .post(format!("{}/foodListings/{route}", self.base))
            .header("x-actor-key", actor.0.to_string())
            .header("x-actor-role", actor.1)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{route} request failed"))?;

        let envelope: Value = response.json().await?;
        println!("{route}: {envelope}");

        if envelope["success"] != true {
            bail!("{route} failed: {}", envelope["message"]);
        }

        Ok(envelope["payload"].clone())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new();
    let session = Session {
        client: &client,
        base: args.url.trim_end_matches('/'),
    };

    let donor = (args.donor, "donor");
    let deliverer = (args.deliverer, "deliverer");

    let expiration = (Utc::now() + Duration::days(3)).date_naive();
    let listing = session
        .call(
            "addFoodListing",
            donor,
            json!({
                "foodTypes": ["baked goods"],
                "perishable": true,
                "foodDescription": "Tester bread loaves",
                "expirationDate": expiration,
                "quantity": args.quantity,
            }),
        )
        .await?;
    let listing_key = listing["listingKey"].clone();

    let mut claim_key = Value::Null;
    for receiver in [args.first_receiver, args.second_receiver] {
        let claim = session
            .call(
                "claimFoodListing",
                (receiver, "receiver"),
                json!({ "listingKey": listing_key, "quantity": 1 }),
            )
            .await?;
        claim_key = claim["claimKey"].clone();
    }

    let pickup = Utc::now() + Duration::hours(1);
    session
        .call(
            "scheduleDelivery",
            deliverer,
            json!({
                "claimKey": claim_key,
                "pickup": { "start": pickup, "end": pickup + Duration::hours(1) },
                "dropoff": { "start": pickup + Duration::hours(1), "end": pickup + Duration::hours(2) },
            }),
        )
        .await?;

    let removed = session
        .call(
            "removeFoodListing",
            donor,
            json!({ "listingKey": listing_key, "reason": "Tester run finished" }),
        )
        .await?;

    println!(
        "Removed listing {listing_key}, {} claims invalidated. Check the server log or webhook for notices.",
        removed["claimsInvalidated"]
    );

    Ok(())
}
