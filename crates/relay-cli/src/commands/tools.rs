use super::print_json;
use relay_core::Gateway;

/// Print the aggregated catalog, one tool per line.
pub async fn list(gateway: &Gateway) -> anyhow::Result<()> {
    for tool in gateway.list_tools().await {
        print_json(&tool)?;
    }
    Ok(())
}

/// Print one status record per running server.
pub async fn status(gateway: &Gateway) -> anyhow::Result<()> {
    for server in gateway.tool_status().await {
        print_json(&server)?;
    }
    Ok(())
}
