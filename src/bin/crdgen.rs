// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CRD YAML Generator
//!
//! Generates Kubernetes CRD YAML files from the Rust types in src/crd.rs so
//! that the manifests in deploy/crds/ never drift from the code.
//!
//! Usage:
//!   cargo run --bin crdgen [output-dir]
//!
//! The output directory defaults to deploy/crds/.

use kube::CustomResourceExt;
use potter_controller::crd::{ClusterBom, ClusterBomSync, DeployItem};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

const COPYRIGHT_HEADER: &str = "# Copyright (c) 2025 Erick Bourgeois, firestoned
# SPDX-License-Identifier: MIT
#
# This file is AUTO-GENERATED from src/crd.rs
# DO NOT EDIT MANUALLY - Run `cargo run --bin crdgen` to regenerate
#
";

const DEFAULT_OUTPUT_DIR: &str = "deploy/crds";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR), PathBuf::from);

    println!("Generating CRD YAML files from src/crd.rs...");
    let written = generate_all(&output_dir)?;
    for filename in &written {
        println!("  ✓ Generated {filename}");
    }

    println!("✓ Successfully generated CRD YAML files in {}", output_dir.display());
    println!("\nNext steps:");
    println!("  1. Review the generated files");
    println!("  2. Deploy with: kubectl apply -f {}", output_dir.display());

    Ok(())
}

/// Writes every CRD into `output_dir` and returns the file names.
fn generate_all(output_dir: &Path) -> Result<Vec<&'static str>, Box<dyn std::error::Error>> {
    fs::create_dir_all(output_dir)?;

    let files = [
        ("clusterboms.crd.yaml", render_crd::<ClusterBom>()?),
        ("deployitems.crd.yaml", render_crd::<DeployItem>()?),
        ("clusterbomsyncs.crd.yaml", render_crd::<ClusterBomSync>()?),
    ];

    let mut written = Vec::with_capacity(files.len());
    for (filename, content) in files {
        fs::write(output_dir.join(filename), content)?;
        written.push(filename);
    }
    Ok(written)
}

/// Renders one CRD as YAML with the generated-file header.
fn render_crd<T>() -> Result<String, Box<dyn std::error::Error>>
where
    T: CustomResourceExt,
{
    let mut crd_json: Value = serde_json::to_value(T::crd())?;

    // Status is written through the status subresource by the controller only.
    if let Some(versions) = crd_json["spec"]["versions"].as_array_mut() {
        for version in versions {
            version["served"] = Value::Bool(true);
            version["storage"] = Value::Bool(true);
        }
    }

    let yaml = serde_yaml::to_string(&crd_json)?;
    Ok(format!("{COPYRIGHT_HEADER}{yaml}"))
}

#[cfg(test)]
mod tests {
    use super::{generate_all, render_crd};
    use potter_controller::crd::{ClusterBom, ClusterBomSync, DeployItem};

    /// Test that all CRDs are written with header and group
    #[test]
    fn test_generate_all_writes_crds() {
        let dir = tempfile::tempdir().unwrap();
        let written = generate_all(dir.path()).unwrap();
        assert_eq!(written.len(), 3);

        let clusterboms = std::fs::read_to_string(dir.path().join("clusterboms.crd.yaml")).unwrap();
        assert!(clusterboms.starts_with("# Copyright"));
        assert!(clusterboms.contains("name: clusterboms.hub.k8s.sap.com"));
        assert!(clusterboms.contains("kind: ClusterBom"));

        let items = std::fs::read_to_string(dir.path().join("deployitems.crd.yaml")).unwrap();
        assert!(items.contains("name: deployitems.landscaper.gardener.cloud"));
    }

    /// Test that every rendered CRD parses back as YAML with a served version
    #[test]
    fn test_render_crd_is_valid_yaml() {
        for rendered in [
            render_crd::<ClusterBom>().unwrap(),
            render_crd::<DeployItem>().unwrap(),
            render_crd::<ClusterBomSync>().unwrap(),
        ] {
            let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
            assert_eq!(parsed["kind"], serde_yaml::Value::from("CustomResourceDefinition"));
            assert_eq!(
                parsed["spec"]["versions"][0]["served"],
                serde_yaml::Value::from(true)
            );
        }
    }
}
