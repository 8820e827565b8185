//! CM-017: CLI subcommands (validate, show, generate, reconcile).

use crate::core::catalog::DomainCatalog;
use crate::core::types::{DeploymentProperties, EditScript};
use crate::core::{generator, parser, reconciler};
use crate::tripwire::drift;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Domain catalog options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct CatalogArgs {
    /// Catalog file (YAML with `domains` and `stacks` lists)
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Additional known domain (repeatable; the first known domain is the default)
    #[arg(long = "domain")]
    pub domains: Vec<String>,

    /// Additional known stack (repeatable)
    #[arg(long = "stack")]
    pub stacks: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a manifest and report per-application errors
    Validate {
        /// Path to manifest.yml
        #[arg(short, long, default_value = "manifest.yml")]
        file: PathBuf,

        #[command(flatten)]
        catalog: CatalogArgs,
    },

    /// Print the deployment properties a manifest describes
    Show {
        /// Path to manifest.yml
        #[arg(short, long, default_value = "manifest.yml")]
        file: PathBuf,

        /// Only this application
        #[arg(short, long)]
        app: Option<String>,

        #[command(flatten)]
        catalog: CatalogArgs,
    },

    /// Generate a manifest from deployment properties
    Generate {
        /// Deployment properties (YAML)
        #[arg(short, long)]
        props: PathBuf,

        #[command(flatten)]
        catalog: CatalogArgs,
    },

    /// Compute the edits that make a manifest describe the given properties
    Reconcile {
        /// Path to manifest.yml (a missing file is treated as empty)
        #[arg(short, long, default_value = "manifest.yml")]
        file: PathBuf,

        /// Deployment properties (YAML)
        #[arg(short, long)]
        props: PathBuf,

        /// Apply the edits to the manifest file
        #[arg(long)]
        write: bool,

        /// Print the edit script as JSON
        #[arg(long)]
        json: bool,

        #[command(flatten)]
        catalog: CatalogArgs,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Validate { file, catalog } => cmd_validate(&file, &load_catalog(&catalog)?),
        Commands::Show { file, app, catalog } => {
            cmd_show(&file, app.as_deref(), &load_catalog(&catalog)?)
        }
        Commands::Generate { props, catalog } => cmd_generate(&props, &load_catalog(&catalog)?),
        Commands::Reconcile {
            file,
            props,
            write,
            json,
            catalog,
        } => cmd_reconcile(&file, &props, write, json, &load_catalog(&catalog)?),
    }
}

/// Build the catalog from an optional file plus command-line additions.
pub fn load_catalog(args: &CatalogArgs) -> Result<DomainCatalog, String> {
    let mut catalog = match &args.catalog {
        Some(path) => DomainCatalog::load(path).map_err(|e| e.to_string())?,
        None => DomainCatalog::default(),
    };
    catalog.extend(args.domains.iter().cloned(), args.stacks.iter().cloned());
    Ok(catalog)
}

fn read_props(path: &Path) -> Result<DeploymentProperties, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    serde_yaml_ng::from_str(&text).map_err(|e| format!("invalid properties {}: {}", path.display(), e))
}

fn cmd_validate(file: &Path, catalog: &DomainCatalog) -> Result<(), String> {
    let parsed = parser::parse_manifest_file(file, catalog).map_err(|e| e.to_string())?;

    if parsed.is_clean() {
        println!("OK: {} application(s)", parsed.applications.len());
        Ok(())
    } else {
        for e in &parsed.errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", parsed.errors.len()))
    }
}

fn cmd_show(file: &Path, app: Option<&str>, catalog: &DomainCatalog) -> Result<(), String> {
    let parsed = parser::parse_manifest_file(file, catalog).map_err(|e| e.to_string())?;
    for e in &parsed.errors {
        eprintln!("  WARNING: {}", e);
    }
    let selected: Vec<&DeploymentProperties> = match app {
        Some(name) => vec![parsed
            .find(name)
            .ok_or_else(|| format!("no application named '{}' in {}", name, file.display()))?],
        None => parsed.applications.iter().collect(),
    };
    let text = serde_yaml_ng::to_string(&selected).map_err(|e| e.to_string())?;
    print!("{}", text);
    Ok(())
}

fn cmd_generate(props: &Path, catalog: &DomainCatalog) -> Result<(), String> {
    let props = read_props(props)?;
    let text = generator::generate_text(&props, catalog).map_err(|e| e.to_string())?;
    print!("{}", text);
    Ok(())
}

fn cmd_reconcile(
    file: &Path,
    props: &Path,
    write: bool,
    json: bool,
    catalog: &DomainCatalog,
) -> Result<(), String> {
    let desired = read_props(props)?;
    let existing = if file.exists() {
        std::fs::read_to_string(file).map_err(|e| format!("cannot read {}: {}", file.display(), e))?
    } else {
        String::new()
    };

    let Some(script) =
        reconciler::reconcile(&desired, &existing, catalog).map_err(|e| e.to_string())?
    else {
        println!("no changes");
        return Ok(());
    };

    print_script(&script, json)?;
    if write {
        write_script(file, &existing, &script)?;
        println!("Wrote {} edit(s) to {}", script.len(), file.display());
    }
    Ok(())
}

fn print_script(script: &EditScript, json: bool) -> Result<(), String> {
    if json {
        let text = serde_json::to_string_pretty(script).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }
    println!("Edits: {} ({})", script.len(), script.base_hash);
    for op in &script.ops {
        println!("  {}", op);
    }
    Ok(())
}

/// Apply `script` to `file`, refusing if the file changed since `existing`
/// was read.
fn write_script(file: &Path, existing: &str, script: &EditScript) -> Result<(), String> {
    if file.exists() {
        if let Some(finding) = drift::check_file_drift(file, &script.base_hash) {
            return Err(format!("refusing to write: {}", finding.detail));
        }
    }
    let updated = script.apply(existing).map_err(|e| e.to_string())?;
    std::fs::write(file, updated).map_err(|e| format!("cannot write {}: {}", file.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = "applications:\n- name: web\n  memory: 512M\n  host: web\n  domain: example.org\n";

    fn catalog() -> DomainCatalog {
        DomainCatalog::new(["example.org"], ["cflinuxfs3"])
    }

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_cm017_validate_valid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", MANIFEST);
        assert!(cmd_validate(&file, &catalog()).is_ok());
    }

    #[test]
    fn test_cm017_validate_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", "applications:\n- name: web\n  memory: lots\n");
        let err = cmd_validate(&file, &catalog()).unwrap_err();
        assert!(err.contains("1 validation error"));
    }

    #[test]
    fn test_cm017_validate_missing_file() {
        let result = cmd_validate(Path::new("/nonexistent/manifest.yml"), &catalog());
        assert!(result.is_err());
    }

    #[test]
    fn test_cm017_show() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", MANIFEST);
        assert!(cmd_show(&file, None, &catalog()).is_ok());
        assert!(cmd_show(&file, Some("web"), &catalog()).is_ok());
        assert!(cmd_show(&file, Some("nope"), &catalog()).is_err());
    }

    #[test]
    fn test_cm017_generate() {
        let dir = tempfile::tempdir().unwrap();
        let props = write(dir.path(), "props.yml", "app-name: web\nmemory: 256\n");
        assert!(cmd_generate(&props, &catalog()).is_ok());
        let bad = write(dir.path(), "bad.yml", "memory: [\n");
        assert!(cmd_generate(&bad, &catalog()).is_err());
    }

    #[test]
    fn test_cm017_reconcile_no_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", MANIFEST);
        let props = write(
            dir.path(),
            "props.yml",
            "app-name: web\nmemory: 512\nuris: [web.example.org]\n",
        );
        assert!(cmd_reconcile(&file, &props, true, false, &catalog()).is_ok());
        assert_eq!(std::fs::read_to_string(&file).unwrap(), MANIFEST);
    }

    #[test]
    fn test_cm017_reconcile_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", MANIFEST);
        let props = write(
            dir.path(),
            "props.yml",
            "app-name: web\nmemory: 1024\ninstances: 2\nuris: [web.example.org]\n",
        );
        cmd_reconcile(&file, &props, true, true, &catalog()).unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "applications:\n- name: web\n  memory: 1024M\n  host: web\n  domain: example.org\n  instances: 2\n"
        );
    }

    #[test]
    fn test_cm017_reconcile_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("manifest.yml");
        let props = write(dir.path(), "props.yml", "app-name: fresh\n");
        cmd_reconcile(&file, &props, true, false, &catalog()).unwrap();
        let text = std::fs::read_to_string(&file).unwrap();
        assert!(text.starts_with("---\napplications:\n- name: fresh\n"));
    }

    #[test]
    fn test_cm017_write_refuses_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", MANIFEST);
        let desired: DeploymentProperties =
            serde_yaml_ng::from_str("app-name: web\nmemory: 2048\nuris: [web.example.org]\n").unwrap();
        let script = reconciler::reconcile(&desired, MANIFEST, &catalog()).unwrap().unwrap();

        // Someone edits the file in between
        std::fs::write(&file, "applications: []\n").unwrap();

        let err = write_script(&file, MANIFEST, &script).unwrap_err();
        assert!(err.contains("refusing to write"));
    }

    #[test]
    fn test_cm017_load_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "catalog.yml", "domains: [cfapps.io]\nstacks: [cflinuxfs3]\n");
        let args = CatalogArgs {
            catalog: Some(path),
            domains: vec!["example.org".into()],
            stacks: vec![],
        };
        let catalog = load_catalog(&args).unwrap();
        assert_eq!(catalog.default_domain(), Some("cfapps.io"));
        assert!(catalog.has_domain("example.org"));
        assert!(catalog.has_stack("cflinuxfs3"));
    }

    #[test]
    fn test_cm017_dispatch_validate() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(dir.path(), "manifest.yml", MANIFEST);
        let result = dispatch(Commands::Validate {
            file,
            catalog: CatalogArgs {
                domains: vec!["example.org".into()],
                ..CatalogArgs::default()
            },
        });
        assert!(result.is_ok());
    }

    #[test]
    fn test_cm017_dispatch_generate() {
        let dir = tempfile::tempdir().unwrap();
        let props = write(dir.path(), "props.yml", "app-name: web\n");
        let result = dispatch(Commands::Generate {
            props,
            catalog: CatalogArgs::default(),
        });
        assert!(result.is_ok());
    }
}
