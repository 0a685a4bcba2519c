// CLI commands for managing Arena language profiles
use anyhow::{bail, Context, Result};
use arena_common::config::EngineConfig;
use arena_common::languages::{LanguageProfile, LanguageTable, TemplateVars};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Write the built-in table to `path`.
pub fn init_languages(path: &Path, force: bool, out: &mut impl Write) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let table = LanguageTable::builtin();
    let json = table.to_json_pretty().context("Failed to serialize language table")?;
    fs::write(path, json + "\n").with_context(|| format!("Failed to write {}", path.display()))?;

    writeln!(out, "✅ Wrote {} language profile(s) to {}", table.languages().len(), path.display())?;
    Ok(())
}

/// List profiles with the limits the engine would apply under the current
/// environment.
pub fn list_languages(path: &Path, out: &mut impl Write) -> Result<()> {
    let config = EngineConfig::from_env().context("Invalid configuration")?;
    list_languages_with(path, &config, out)
}

fn list_languages_with(path: &Path, config: &EngineConfig, out: &mut impl Write) -> Result<()> {
    let table = LanguageTable::load(path)?;
    let limits = &config.limits;

    writeln!(out, "📋 Configured Languages:\n")?;
    writeln!(
        out,
        "{:<12} {:<10} {:<6} {:<9} {:<28} {:<10}",
        "NAME", "VERSION", "EXT", "COMPILED", "IMAGE", "LIMITS"
    )?;
    writeln!(out, "{}", "─".repeat(84))?;
    for profile in table.profiles() {
        writeln!(
            out,
            "{:<12} {:<10} {:<6} {:<9} {:<28} {} MB / {:.1} CPU",
            profile.name.as_str(),
            profile.version,
            profile.file_extension,
            if profile.is_compiled() { "yes" } else { "no" },
            profile.image,
            profile.memory_limit_mb.unwrap_or(limits.memory_mb),
            profile.cpu_limit.unwrap_or(limits.cpu_limit),
        )?;
    }
    writeln!(out, "\n✅ Total: {} language(s)", table.languages().len())?;
    Ok(())
}

/// Load and validate `path`, then trial-render every command template.
pub fn check_languages(path: &Path, out: &mut impl Write) -> Result<()> {
    let table = LanguageTable::load(path).with_context(|| format!("{} is invalid", path.display()))?;

    for profile in table.profiles() {
        trial_render(profile)?;
        writeln!(out, "  ✅ {}", profile.name)?;
    }
    writeln!(out, "\n✅ {} is valid", path.display())?;
    Ok(())
}

fn trial_render(profile: &LanguageProfile) -> Result<()> {
    let vars = TemplateVars {
        source: "/sandbox/code.src",
        binary: "/sandbox/exec",
        dir: "/sandbox",
        entry: profile.entry_class.as_deref().unwrap_or("Main"),
    };
    if let Some(compile) = &profile.compile {
        compile
            .render(&vars)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("{}: compile command does not render", profile.name))?;
    }
    profile
        .run
        .render(&vars)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("{}: run command does not render", profile.name))?;
    Ok(())
}

pub fn show_config(out: &mut impl Write) -> Result<()> {
    let config = EngineConfig::from_env().context("Invalid configuration")?;
    writeln!(out, "{}", serde_json::to_string_pretty(&config)?)?;
    Ok(())
}
