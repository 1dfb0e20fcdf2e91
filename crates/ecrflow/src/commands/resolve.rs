use colored::Colorize;

/// レジストリのアドレスを解決して表示
pub fn handle(address: &str, label: Option<&str>) -> anyhow::Result<()> {
    let identity = ecrflow_registry::resolve(address)?;

    println!("{} {}", "Endpoint:".bold(), identity.endpoint);
    println!("{} {}", "Host:".bold(), identity.host);
    println!("{} {}", "Repository:".bold(), identity.path);
    if identity.is_public() {
        println!("{} {}", "Type:".bold(), "ECR Public".cyan());
    } else {
        println!("{} {}", "Type:".bold(), "ECR".cyan());
        if let Some(region) = identity.region_hint() {
            println!("{} {}", "Region:".bold(), region);
        }
    }

    if let Some(label) = label {
        println!("{} {}", "Tag:".bold(), identity.tag(label).green());
    }

    Ok(())
}
