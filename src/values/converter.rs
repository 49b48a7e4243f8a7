//! Deterministic Compose → Helm-values conversion.
//!
//! Each service's keys are consumed via `Mapping::remove`, so "unsupported
//! key" detection falls out of whatever remains in the mapping afterward
//! rather than an explicit allow-list walk.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::{Mapping, Value};

use crate::errors::{Result, ValidationError};

static BYTES_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d+(?:\.\d+)?)(b|k|m|g)(b)?$").expect("valid regex"));
static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("valid regex"));

const TOP_LEVEL_ALLOWED: &[&str] = &["services", "volumes", "version", "x-inspect_k8s_sandbox"];

/// Converts a parsed Compose document into a Helm values document.
pub fn convert_compose_to_values(doc: &Value, source: &str) -> Result<Value> {
    let map = doc
        .as_mapping()
        .ok_or_else(|| unsupported("compose document must be a mapping", source))?;

    if let Some(unknown) = first_unknown_key(map, TOP_LEVEL_ALLOWED) {
        return Err(ValidationError::UnsupportedKeys {
            context: format!("top level of {source}"),
            keys: vec![unknown],
        }
        .into());
    }

    let mut out = Mapping::new();

    let mut services_out = Mapping::new();
    if let Some(services) = map.get("services").and_then(Value::as_mapping) {
        for (key, body) in services {
            let name = key.as_str().unwrap_or_default().to_string();
            let body = body.as_mapping().cloned().unwrap_or_default();
            let converted = convert_service(&name, body, source)?;
            services_out.insert(Value::String(name), Value::Mapping(converted));
        }
    }
    out.insert(Value::String("services".into()), Value::Mapping(services_out));

    if let Some(volumes) = map.get("volumes").and_then(Value::as_mapping) {
        out.insert(
            Value::String("volumes".into()),
            Value::Mapping(convert_top_level_volumes(volumes, source)?),
        );
    }

    if let Some(ext) = map.get("x-inspect_k8s_sandbox").and_then(Value::as_mapping) {
        if let Some(domains) = convert_extension(ext, source)? {
            out.insert(Value::String("allowDomains".into()), domains);
        }
    }

    Ok(Value::Mapping(out))
}

fn convert_service(name: &str, mut service: Mapping, source: &str) -> Result<Mapping> {
    let mut result = Mapping::new();

    if let Some(image) = service.remove("image") {
        result.insert(Value::String("image".into()), image);
    }
    if let Some(entrypoint) = service.remove("entrypoint") {
        result.insert(Value::String("command".into()), split_string_or_list(entrypoint)?);
    }
    if let Some(command) = service.remove("command") {
        result.insert(Value::String("args".into()), split_string_or_list(command)?);
    }
    if let Some(working_dir) = service.remove("working_dir") {
        result.insert(Value::String("workingDir".into()), working_dir);
    }
    if let Some(runtime) = service.remove("runtime") {
        result.insert(Value::String("runtimeClassName".into()), runtime);
    }
    if let Some(user) = service.remove("user") {
        let security_context = convert_user(&user, name)?;
        result.insert(Value::String("securityContext".into()), Value::Mapping(security_context));
    }
    if let Some(env) = service.remove("environment") {
        result.insert(Value::String("env".into()), Value::Sequence(convert_environment(env, name)?));
    }
    if let Some(volumes) = service.remove("volumes") {
        result.insert(Value::String("volumes".into()), convert_service_volumes(volumes)?);
    }
    if let Some(healthcheck) = service.remove("healthcheck") {
        let hc = healthcheck
            .as_mapping()
            .cloned()
            .ok_or_else(|| unsupported("healthcheck must be a mapping", source))?;
        result.insert(
            Value::String("readinessProbe".into()),
            Value::Mapping(convert_healthcheck(hc, name)?),
        );
    }

    let mem_limit = service.remove("mem_limit");
    let deploy = service.remove("deploy");
    if let Some(resources) = convert_deploy_or_mem_limit(deploy, mem_limit, name)? {
        result.insert(Value::String("resources".into()), Value::Mapping(resources));
    }

    if service.remove("init").is_some() {
        debug!(service = name, "ignoring 'init' key in compose service");
    }
    if service.remove("expose").is_some() {
        debug!(service = name, "ignoring 'expose' key in compose service");
    }

    if let Some(unknown) = first_unknown_key(&service, &[]) {
        return Err(ValidationError::UnsupportedKeys {
            context: format!("service '{name}' ({source})"),
            keys: vec![unknown],
        }
        .into());
    }

    result.insert(Value::String("dnsRecord".into()), Value::Bool(true));
    Ok(result)
}

fn split_string_or_list(value: Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::Sequence(
            s.split_whitespace().map(|p| Value::String(p.to_string())).collect(),
        )),
        Value::Sequence(_) => Ok(value),
        other => Err(unsupported(&format!("expected a string or list, got {other:?}"), "")),
    }
}

fn convert_user(value: &Value, service: &str) -> Result<Mapping> {
    let raw = value
        .as_str()
        .ok_or_else(|| unsupported(&format!("service '{service}': 'user' must be a string"), ""))?;
    let mut parts = raw.splitn(2, ':');
    let uid_str = parts.next().unwrap_or_default();
    let gid_str = parts.next();
    let uid: i64 = uid_str
        .parse()
        .map_err(|_| unsupported(&format!("service '{service}': non-integer uid in 'user': '{raw}'"), ""))?;
    let mut result = Mapping::new();
    result.insert(Value::String("runAsUser".into()), Value::Number(uid.into()));
    if let Some(gid_str) = gid_str {
        let gid: i64 = gid_str
            .parse()
            .map_err(|_| unsupported(&format!("service '{service}': non-integer gid in 'user': '{raw}'"), ""))?;
        result.insert(Value::String("runAsGroup".into()), Value::Number(gid.into()));
    }
    Ok(result)
}

fn convert_environment(value: Value, service: &str) -> Result<Vec<Value>> {
    match value {
        Value::Mapping(map) => Ok(map
            .into_iter()
            .map(|(k, v)| {
                let mut entry = Mapping::new();
                entry.insert(Value::String("name".into()), k);
                entry.insert(Value::String("value".into()), v);
                Value::Mapping(entry)
            })
            .collect()),
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|item| {
                let raw = item
                    .as_str()
                    .ok_or_else(|| unsupported(&format!("service '{service}': environment entry must be a string"), ""))?;
                let (key, val) = raw
                    .split_once('=')
                    .ok_or_else(|| unsupported(&format!("service '{service}': environment entry '{raw}' missing '='"), ""))?;
                let mut entry = Mapping::new();
                entry.insert(Value::String("name".into()), Value::String(key.to_string()));
                entry.insert(Value::String("value".into()), Value::String(val.to_string()));
                Ok(Value::Mapping(entry))
            })
            .collect(),
        other => Err(unsupported(
            &format!("service '{service}': 'environment' must be a mapping or list, got {other:?}"),
            "",
        )),
    }
}

fn convert_service_volumes(value: Value) -> Result<Value> {
    let seq = value
        .as_sequence()
        .ok_or_else(|| unsupported("'volumes' must be a list", ""))?;
    let converted = seq
        .iter()
        .map(|entry| {
            let raw = entry
                .as_str()
                .ok_or_else(|| unsupported("volume entries must be HOST:MOUNT strings", ""))?;
            let (host, mount) = raw
                .split_once(':')
                .ok_or_else(|| unsupported(&format!("volume entry '{raw}' is not HOST:MOUNT"), ""))?;
            Ok(Value::String(format!("{}:{}", host.replace('_', "-"), mount)))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Value::Sequence(converted))
}

fn convert_healthcheck(mut hc: Mapping, service: &str) -> Result<Mapping> {
    let mut result = Mapping::new();
    let test = hc
        .remove("test")
        .and_then(|v| v.as_sequence().cloned())
        .ok_or_else(|| unsupported(&format!("service '{service}': healthcheck.test must be a list"), ""))?;
    let test: Vec<String> = test.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
    let exec_command = match test.first().map(String::as_str) {
        Some("CMD") => test[1..].to_vec(),
        Some("CMD-SHELL") => {
            let script = test
                .get(1)
                .ok_or_else(|| unsupported(&format!("service '{service}': CMD-SHELL requires a script"), ""))?;
            vec!["sh".to_string(), "-c".to_string(), script.clone()]
        }
        _ => {
            return Err(unsupported(
                &format!("service '{service}': unsupported healthcheck test form {test:?}"),
                "",
            ));
        }
    };
    let mut exec = Mapping::new();
    exec.insert(
        Value::String("command".into()),
        Value::Sequence(exec_command.into_iter().map(Value::String).collect()),
    );
    result.insert(Value::String("exec".into()), Value::Mapping(exec));

    if let Some(interval) = hc.remove("interval") {
        result.insert(
            Value::String("periodSeconds".into()),
            Value::Number(parse_duration_seconds(required_str(&interval, service, "interval")?)?.into()),
        );
    }
    if let Some(timeout) = hc.remove("timeout") {
        result.insert(
            Value::String("timeoutSeconds".into()),
            Value::Number(parse_duration_seconds(required_str(&timeout, service, "timeout")?)?.into()),
        );
    }
    if let Some(start_period) = hc.remove("start_period") {
        result.insert(
            Value::String("initialDelaySeconds".into()),
            Value::Number(parse_duration_seconds(required_str(&start_period, service, "start_period")?)?.into()),
        );
    }
    if let Some(retries) = hc.remove("retries") {
        let retries = retries
            .as_i64()
            .ok_or_else(|| unsupported(&format!("service '{service}': healthcheck.retries must be an int"), ""))?;
        result.insert(Value::String("failureThreshold".into()), Value::Number((retries + 1).into()));
    }

    if let Some(unknown) = first_unknown_key(&hc, &[]) {
        return Err(ValidationError::UnsupportedKeys {
            context: format!("healthcheck of service '{service}'"),
            keys: vec![unknown],
        }
        .into());
    }
    Ok(result)
}

fn required_str<'a>(value: &'a Value, service: &str, field: &str) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| unsupported(&format!("service '{service}': healthcheck.{field} must be a string"), ""))
}

fn convert_deploy_or_mem_limit(deploy: Option<Value>, mem_limit: Option<Value>, service: &str) -> Result<Option<Mapping>> {
    if let Some(deploy) = deploy {
        let mut deploy_map = deploy
            .as_mapping()
            .cloned()
            .ok_or_else(|| unsupported(&format!("service '{service}': 'deploy' must be a mapping"), ""))?;
        let resources = deploy_map
            .remove("resources")
            .and_then(|v| v.as_mapping().cloned())
            .unwrap_or_default();
        if let Some(unknown) = first_unknown_key(&deploy_map, &[]) {
            return Err(ValidationError::UnsupportedKeys {
                context: format!("deploy of service '{service}'"),
                keys: vec![unknown],
            }
            .into());
        }
        return Ok(Some(convert_resources(resources, service)?));
    }
    if let Some(mem_limit) = mem_limit {
        let memory = parse_byte_quantity(mem_limit.as_str().unwrap_or_default())?;
        let mut limits = Mapping::new();
        limits.insert(Value::String("memory".into()), Value::String(memory.clone()));
        let mut result = Mapping::new();
        result.insert(Value::String("limits".into()), Value::Mapping(limits.clone()));
        result.insert(Value::String("requests".into()), Value::Mapping(limits));
        return Ok(Some(result));
    }
    Ok(None)
}

fn convert_resources(mut resources: Mapping, service: &str) -> Result<Mapping> {
    let mut result = Mapping::new();
    let limits = resources
        .remove("limits")
        .and_then(|v| v.as_mapping().cloned())
        .map(|m| convert_resource_entry(m, service))
        .transpose()?;
    let reservations = resources
        .remove("reservations")
        .and_then(|v| v.as_mapping().cloned())
        .map(|m| convert_resource_entry(m, service))
        .transpose()?;

    if let Some(unknown) = first_unknown_key(&resources, &[]) {
        return Err(ValidationError::UnsupportedKeys {
            context: format!("deploy.resources of service '{service}'"),
            keys: vec![unknown],
        }
        .into());
    }

    if let Some(limits) = limits.clone() {
        result.insert(Value::String("limits".into()), Value::Mapping(limits));
    }
    match reservations {
        Some(reservations) => {
            result.insert(Value::String("requests".into()), Value::Mapping(reservations));
        }
        None => {
            if let Some(limits) = limits {
                result.insert(Value::String("requests".into()), Value::Mapping(limits));
            }
        }
    }
    Ok(result)
}

fn convert_resource_entry(mut entry: Mapping, service: &str) -> Result<Mapping> {
    let mut result = Mapping::new();
    if let Some(cpus) = entry.remove("cpus") {
        result.insert(Value::String("cpu".into()), cpus);
    }
    if let Some(memory) = entry.remove("memory") {
        let memory = memory
            .as_str()
            .ok_or_else(|| unsupported(&format!("service '{service}': resource memory must be a string"), ""))?;
        result.insert(Value::String("memory".into()), Value::String(parse_byte_quantity(memory)?));
    }
    if let Some(unknown) = first_unknown_key(&entry, &[]) {
        return Err(ValidationError::UnsupportedKeys {
            context: format!("resource entry of service '{service}'"),
            keys: vec![unknown],
        }
        .into());
    }
    Ok(result)
}

fn convert_top_level_volumes(volumes: &Mapping, source: &str) -> Result<Mapping> {
    let mut result = Mapping::new();
    for (key, body) in volumes {
        if !matches!(body, Value::Null) && body.as_mapping().map(|m| !m.is_empty()).unwrap_or(true) {
            return Err(unsupported(&format!("top-level volume '{key:?}' must have an empty body"), source));
        }
        let name = key.as_str().unwrap_or_default().replace('_', "-");
        result.insert(Value::String(name), Value::Mapping(Mapping::new()));
    }
    Ok(result)
}

fn convert_extension(ext: &Mapping, source: &str) -> Result<Option<Value>> {
    let mut ext = ext.clone();
    let domains = ext.remove("allow_domains");
    if let Some(unknown) = first_unknown_key(&ext, &[]) {
        return Err(ValidationError::UnsupportedKeys {
            context: format!("x-inspect_k8s_sandbox of {source}"),
            keys: vec![unknown],
        }
        .into());
    }
    let Some(domains) = domains else { return Ok(None) };
    let seq = domains
        .as_sequence()
        .ok_or_else(|| unsupported("x-inspect_k8s_sandbox.allow_domains must be a list of strings", source))?;
    for d in seq {
        if d.as_str().is_none() {
            return Err(unsupported("x-inspect_k8s_sandbox.allow_domains must be a list of strings", source));
        }
    }
    Ok(Some(Value::Sequence(seq.clone())))
}

/// Parses a Docker Compose byte quantity (`512b`, `1k`, `2mb`, `3G`,
/// `0.5G`) into the Kubernetes quantity suffix form.
pub fn parse_byte_quantity(raw: &str) -> Result<String> {
    let caps = BYTES_RE
        .captures(raw)
        .ok_or_else(|| unsupported(&format!("unrecognised byte quantity: '{raw}'"), ""))?;
    let number = &caps[1];
    let unit = caps[2].to_lowercase();
    let suffix = match unit.as_str() {
        "b" => "",
        "k" => "Ki",
        "m" => "Mi",
        "g" => "Gi",
        _ => unreachable!(),
    };
    Ok(format!("{number}{suffix}"))
}

/// Parses a sum of `<int><unit>` segments (`s|m|h`, strictly in that
/// descending order) into total seconds.
pub fn parse_duration_seconds(raw: &str) -> Result<i64> {
    let caps = DURATION_RE
        .captures(raw)
        .filter(|c| c.iter().skip(1).any(|g| g.is_some()))
        .ok_or_else(|| unsupported(&format!("unsupported duration format: '{raw}'"), ""))?;
    let hours: i64 = caps.get(1).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let minutes: i64 = caps.get(2).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    let seconds: i64 = caps.get(3).map(|m| m.as_str().parse().unwrap_or(0)).unwrap_or(0);
    Ok(hours * 3600 + minutes * 60 + seconds)
}

fn first_unknown_key(map: &Mapping, allowed: &[&str]) -> Option<String> {
    map.keys()
        .find(|k| {
            let name = k.as_str().unwrap_or_default();
            !allowed.contains(&name)
        })
        .map(|k| k.as_str().unwrap_or_default().to_string())
}

fn unsupported(message: &str, source: &str) -> crate::errors::SandboxError {
    ValidationError::Other(if source.is_empty() {
        message.to_string()
    } else {
        format!("{message} (source: {source})")
    })
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration_seconds("42s").unwrap(), 42);
        assert_eq!(parse_duration_seconds("42m").unwrap(), 2520);
        assert_eq!(parse_duration_seconds("42h").unwrap(), 151200);
        assert_eq!(parse_duration_seconds("1h2m3s").unwrap(), 3723);
        assert!(parse_duration_seconds("1d").is_err());
        assert!(parse_duration_seconds("1s2m3h").is_err());
    }

    #[test]
    fn byte_parsing() {
        assert_eq!(parse_byte_quantity("512b").unwrap(), "512");
        assert_eq!(parse_byte_quantity("1k").unwrap(), "1Ki");
        assert_eq!(parse_byte_quantity("2mb").unwrap(), "2Mi");
        assert_eq!(parse_byte_quantity("3G").unwrap(), "3Gi");
        assert_eq!(parse_byte_quantity("0.5G").unwrap(), "0.5Gi");
        assert!(parse_byte_quantity("1x").is_err());
    }

    #[test]
    fn healthcheck_conversion() {
        let hc: Mapping = serde_yaml::from_str(
            "test: [CMD, curl, -f, 'http://localhost']\ninterval: 30s\ntimeout: 10s\nstart_period: 40s\nretries: 3\n",
        )
        .unwrap();
        let converted = convert_healthcheck(hc, "web").unwrap();
        let exec = converted.get("exec").unwrap().as_mapping().unwrap();
        let command = exec.get("command").unwrap().as_sequence().unwrap();
        let command: Vec<&str> = command.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(command, vec!["curl", "-f", "http://localhost"]);
        assert_eq!(converted.get("periodSeconds").unwrap().as_i64().unwrap(), 30);
        assert_eq!(converted.get("timeoutSeconds").unwrap().as_i64().unwrap(), 10);
        assert_eq!(converted.get("initialDelaySeconds").unwrap().as_i64().unwrap(), 40);
        assert_eq!(converted.get("failureThreshold").unwrap().as_i64().unwrap(), 4);
    }

    #[test]
    fn rejects_unsupported_service_key() {
        let doc: Value = serde_yaml::from_str("services:\n  web:\n    image: redis\n    network_mode: host\n").unwrap();
        let err = convert_compose_to_values(&doc, "compose.yaml").unwrap_err();
        assert!(err.to_string().contains("network_mode"));
    }

    #[test]
    fn every_service_gets_dns_record() {
        let doc: Value = serde_yaml::from_str("services:\n  web:\n    image: redis\n").unwrap();
        let converted = convert_compose_to_values(&doc, "compose.yaml").unwrap();
        let web = converted.get("services").unwrap().get("web").unwrap();
        assert_eq!(web.get("dnsRecord").unwrap().as_bool().unwrap(), true);
    }

    #[test]
    fn volume_host_underscores_become_hyphens() {
        let doc: Value =
            serde_yaml::from_str("services:\n  web:\n    image: redis\n    volumes:\n      - my_vol:/data\n").unwrap();
        let converted = convert_compose_to_values(&doc, "compose.yaml").unwrap();
        let volumes = converted
            .get("services")
            .unwrap()
            .get("web")
            .unwrap()
            .get("volumes")
            .unwrap()
            .as_sequence()
            .unwrap();
        assert_eq!(volumes[0].as_str().unwrap(), "my-vol:/data");
    }

    #[test]
    fn mem_limit_applies_to_limits_and_requests_by_default() {
        let doc: Value = serde_yaml::from_str("services:\n  web:\n    image: redis\n    mem_limit: 512m\n").unwrap();
        let converted = convert_compose_to_values(&doc, "compose.yaml").unwrap();
        let resources = converted.get("services").unwrap().get("web").unwrap().get("resources").unwrap();
        assert_eq!(resources.get("limits").unwrap().get("memory").unwrap().as_str().unwrap(), "512Mi");
        assert_eq!(resources.get("requests").unwrap().get("memory").unwrap().as_str().unwrap(), "512Mi");
    }
}
