use anyhow::{Context, Result};
use svnlift::config::SvnliftConfig;
use svnlift::migration::browser::repository_structure;
use svnlift::migration::server::build_browser;

pub async fn cmd_browse(config: &SvnliftConfig, repo: &str) -> Result<()> {
    if config.svn.url.is_empty() {
        anyhow::bail!("No Subversion URL configured. Set [svn] url or SVNLIFT_SVN_URL.");
    }
    let browser = build_browser(config);
    let structure = repository_structure(&browser, repo)
        .await
        .with_context(|| format!("Failed to browse {}", repo))?;

    if structure.flat {
        println!("{}: flat (trunk/branches/tags at the root)", structure.name);
        return Ok(());
    }
    println!("{}: {} module(s)", structure.name, structure.modules.len());
    for module in &structure.modules {
        println!("  {}", module.path);
        for sub in &module.sub_modules {
            println!("    {}", sub.path);
        }
    }
    Ok(())
}
