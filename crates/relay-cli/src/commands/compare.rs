use super::print_json;
use relay_core::{CompareEvent, CompareResult, CompareTarget, Gateway};
use relay_provider::ChatRequest;
use serde::Serialize;

/// Final record for one target.
#[derive(Serialize)]
struct ResultRecord<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    index: usize,
    #[serde(flatten)]
    result: &'a CompareResult,
}

/// Fan one request out to every target, streaming events as they arrive.
pub async fn run(
    gateway: &Gateway,
    targets: &[CompareTarget],
    request: ChatRequest,
) -> anyhow::Result<()> {
    let stream = gateway.open_stream();
    let stream_id = stream.id().clone();

    let mut write_error = None;
    let results = {
        let mut sink = |event: CompareEvent| {
            if let Err(err) = print_json(&event) {
                write_error.get_or_insert(err);
            }
        };
        let compare = gateway.compare(stream, targets, request, &mut sink);
        tokio::pin!(compare);
        let results = tokio::select! {
            results = &mut compare => results,
            _ = tokio::signal::ctrl_c() => {
                gateway.cancel(stream_id.as_str());
                compare.await
            }
        };
        results
    };
    if let Some(err) = write_error {
        return Err(err);
    }

    for (index, result) in results.iter().enumerate() {
        print_json(&ResultRecord {
            kind: "result",
            index,
            result,
        })?;
    }
    Ok(())
}
