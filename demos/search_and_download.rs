use anyhow::Result;
use chrono::NaiveDate;
use m2mapi::{Client, MetadataFilter, Predicate, RetrieveOptions, SearchCriteria, Spatial};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    // Example program that calls the library API.
    // Configure credentials via env vars or a `.m2mrc` file; RUST_LOG=m2mapi=debug for details.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut client = Client::from_env()?;

    let dataset = "landsat_ot_c2_l1";
    let criteria = SearchCriteria::new(dataset)
        .with_dates(
            NaiveDate::from_ymd_opt(2020, 8, 1),
            NaiveDate::from_ymd_opt(2020, 8, 31),
        )
        .with_spatial(Spatial::bbox(
            -126.47175275298368,
            -112.426440180154,
            32.13566490555765,
            42.399334704429755,
        ))
        .with_metadata(MetadataFilter::And(vec![
            Predicate::value("Sensor Identifier", "OLI_TIRS"),
            Predicate::value("Data Type L1", "L1TP"),
            Predicate::value("Collection Category", "T1"),
        ]))
        .with_max_results(3);

    let scenes = client.search_scenes(&criteria)?;
    for scene in &scenes.results {
        println!(
            "{} cloud cover {:?}",
            scene.display_id,
            scene.cloud_cover_percent()
        );
    }

    let meta = client.retrieve_scenes(
        dataset,
        &scenes.results,
        &RetrieveOptions::default().with_output_dir("ingest"),
    )?;
    println!("{}", serde_json::to_string_pretty(&meta)?);

    client.logout()?;
    Ok(())
}
