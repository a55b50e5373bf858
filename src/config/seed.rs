//! Startup seed: the default namespace plus `proxy.init_resources`, as change logs.
use base64::{Engine, engine::general_purpose::STANDARD};
use eyre::{Context, Result};

use crate::{
    config::models::{DGateConfig, InitResources},
    core::{
        change_log::{ChangeLog, Command, Resource},
        resources::{Namespace, NamespacedResource},
    },
};

/// Change logs applied to an empty graph before persisted or replicated logs.
pub fn seed_change_logs(config: &DGateConfig) -> Result<Vec<ChangeLog>> {
    let mut logs = Vec::new();
    if !config.disable_default_namespace {
        let ns = Namespace::default_namespace();
        logs.push(ChangeLog::new(
            Command::add(Resource::Namespaces),
            &ns.name,
            &ns.name,
            &ns,
        )?);
    }
    if let Some(init) = &config.proxy.init_resources {
        logs.extend(init_resource_logs(init)?);
    }
    Ok(logs)
}

fn push<T>(logs: &mut Vec<ChangeLog>, resource: Resource, item: &T) -> Result<()>
where
    T: NamespacedResource + serde::Serialize,
{
    logs.push(ChangeLog::new(
        Command::add(resource),
        item.namespace(),
        item.name(),
        item,
    )?);
    Ok(())
}

fn init_resource_logs(init: &InitResources) -> Result<Vec<ChangeLog>> {
    let mut logs = Vec::new();
    for ns in &init.namespaces {
        logs.push(ChangeLog::new(
            Command::add(Resource::Namespaces),
            &ns.name,
            &ns.name,
            ns,
        )?);
    }
    for spec in &init.modules {
        let payload = match (&spec.payload, &spec.payload_file) {
            (Some(source), _) => STANDARD.encode(source),
            (None, Some(file)) => {
                let source = std::fs::read(file)
                    .with_context(|| format!("reading payload file for module {}", spec.name))?;
                STANDARD.encode(source)
            }
            (None, None) => eyre::bail!("module {}: payload or payload_file required", spec.name),
        };
        push(&mut logs, Resource::Modules, &spec.to_module(payload))?;
    }
    for service in &init.services {
        push(&mut logs, Resource::Services, service)?;
    }
    for route in &init.routes {
        push(&mut logs, Resource::Routes, route)?;
    }
    for spec in &init.domains {
        let cert = match &spec.cert_file {
            Some(file) => std::fs::read_to_string(file)
                .with_context(|| format!("reading cert file for domain {}", spec.name))?,
            None => spec.cert.clone(),
        };
        let key = match &spec.key_file {
            Some(file) => std::fs::read_to_string(file)
                .with_context(|| format!("reading key file for domain {}", spec.name))?,
            None => spec.key.clone(),
        };
        push(&mut logs, Resource::Domains, &spec.to_domain(cert, key))?;
    }
    for collection in &init.collections {
        push(&mut logs, Resource::Collections, collection)?;
    }
    for document in &init.documents {
        logs.push(ChangeLog::new(
            Command::add(Resource::Documents),
            &document.namespace,
            &document.id,
            document,
        )?);
    }
    for secret in &init.secrets {
        let mut secret = secret.clone();
        secret.data = STANDARD.encode(&secret.data);
        push(&mut logs, Resource::Secrets, &secret)?;
    }
    Ok(logs)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{
        config::models::ModuleSpec,
        core::resources::{Module, Service},
    };

    #[test]
    fn test_default_namespace_first() {
        let logs = seed_change_logs(&DGateConfig::default()).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].cmd.to_string(), "add_namespace");
        assert_eq!(logs[0].name, "default");

        let config = DGateConfig {
            disable_default_namespace: true,
            ..Default::default()
        };
        assert!(seed_change_logs(&config).unwrap().is_empty());
    }

    #[test]
    fn test_init_resources_order_and_payloads() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "export const requestHandler = () => {{}};").unwrap();

        let mut config = DGateConfig::default();
        config.disable_default_namespace = true;
        config.proxy.init_resources = Some(InitResources {
            namespaces: vec![Namespace::new("n1")],
            services: vec![Service {
                name: "s1".into(),
                namespace: "n1".into(),
                urls: vec!["http://u/".into()],
                ..Default::default()
            }],
            modules: vec![
                ModuleSpec {
                    name: "inline".into(),
                    namespace: "n1".into(),
                    payload: Some("1 + 1".into()),
                    ..Default::default()
                },
                ModuleSpec {
                    name: "file".into(),
                    namespace: "n1".into(),
                    payload_file: Some(file.path().to_string_lossy().into_owned()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        });

        let logs = seed_change_logs(&config).unwrap();
        let cmds: Vec<String> = logs.iter().map(|l| l.cmd.to_string()).collect();
        assert_eq!(
            cmds,
            vec!["add_namespace", "add_module", "add_module", "add_service"]
        );
        let inline: Module = logs[1].decode_item().unwrap();
        assert_eq!(inline.payload, STANDARD.encode("1 + 1"));
        let from_file: Module = logs[2].decode_item().unwrap();
        assert_eq!(
            STANDARD.decode(from_file.payload).unwrap(),
            b"export const requestHandler = () => {};"
        );
    }
}
