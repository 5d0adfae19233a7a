//! Service start order
//!
//! Depth-first topological sort over `depends_on`. Services are visited in
//! name order so the result is the same for every run over the same input.

use super::resolve::ResolvedProject;
use crate::error::{Result, StevedoreError};
use std::collections::{BTreeMap, BTreeSet};

/// Start order for every service in the project
pub fn start_order(project: &ResolvedProject) -> Result<Vec<String>> {
    let graph = graph(project);
    let mut order = Vec::with_capacity(graph.len());
    let mut visited = BTreeSet::new();
    let mut path = Vec::new();

    for service in graph.keys() {
        visit(service, &graph, &mut visited, &mut path, &mut order)?;
    }

    Ok(order)
}

/// Stop order: the start order reversed
pub fn stop_order(project: &ResolvedProject) -> Result<Vec<String>> {
    let mut order = start_order(project)?;
    order.reverse();
    Ok(order)
}

/// Start order restricted to `selected` and everything they depend on
///
/// An empty selection means the whole project.
pub fn start_order_for(project: &ResolvedProject, selected: &[String]) -> Result<Vec<String>> {
    if selected.is_empty() {
        return start_order(project);
    }

    let wanted = with_dependencies(project, selected)?;
    Ok(start_order(project)?
        .into_iter()
        .filter(|s| wanted.contains(s))
        .collect())
}

/// `selected` plus the transitive closure of their dependencies
pub fn with_dependencies(project: &ResolvedProject, selected: &[String]) -> Result<BTreeSet<String>> {
    let mut wanted = BTreeSet::new();
    let mut stack: Vec<String> = Vec::new();

    for name in selected {
        project.service(name)?;
        stack.push(name.clone());
    }

    while let Some(name) = stack.pop() {
        if !wanted.insert(name.clone()) {
            continue;
        }
        for dep in &project.service(&name)?.depends_on {
            stack.push(dep.clone());
        }
    }

    Ok(wanted)
}

fn graph(project: &ResolvedProject) -> BTreeMap<&str, Vec<&str>> {
    project
        .services
        .iter()
        .map(|(name, spec)| {
            let mut deps: Vec<&str> = spec.depends_on.iter().map(String::as_str).collect();
            deps.sort_unstable();
            deps.dedup();
            (name.as_str(), deps)
        })
        .collect()
}

fn visit<'a>(
    service: &'a str,
    graph: &BTreeMap<&'a str, Vec<&'a str>>,
    visited: &mut BTreeSet<&'a str>,
    path: &mut Vec<&'a str>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(service) {
        return Ok(());
    }

    if let Some(pos) = path.iter().position(|s| *s == service) {
        let mut cycle: Vec<&str> = path[pos..].to_vec();
        cycle.push(service);
        return Err(StevedoreError::Configuration(format!(
            "Circular dependency: {}",
            cycle.join(" -> ")
        )));
    }

    let deps = graph
        .get(service)
        .ok_or_else(|| StevedoreError::ServiceNotFound(service.to_string()))?;

    path.push(service);
    for dep in deps {
        visit(dep, graph, visited, path, order)?;
    }
    path.pop();

    visited.insert(service);
    order.push(service.to_string());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::env::Environment;
    use crate::compose::parser::ComposeParser;
    use crate::compose::resolve::Resolver;
    use std::path::Path;

    fn project(yaml: &str) -> ResolvedProject {
        let env = Environment::new();
        let parsed = ComposeParser::parse_str(yaml, &env).unwrap();
        Resolver::new(&env, Path::new("/srv/test")).resolve(parsed).unwrap()
    }

    const CHAIN: &str = r#"
services:
  web:
    image: nginx
    depends_on:
      - api
  api:
    image: node
    depends_on:
      db:
        condition: service_started
  db:
    image: postgres
  cache:
    image: redis
"#;

    #[test]
    fn test_dependencies_start_first() {
        let order = start_order(&project(CHAIN)).unwrap();
        assert_eq!(order, vec!["db", "api", "cache", "web"]);
    }

    #[test]
    fn test_stop_order_is_reversed() {
        let order = stop_order(&project(CHAIN)).unwrap();
        assert_eq!(order, vec!["web", "cache", "api", "db"]);
    }

    #[test]
    fn test_selection_pulls_in_dependencies() {
        let p = project(CHAIN);
        let order = start_order_for(&p, &["api".to_string()]).unwrap();
        assert_eq!(order, vec!["db", "api"]);

        let order = start_order_for(&p, &[]).unwrap();
        assert_eq!(order.len(), 4);

        assert!(matches!(
            start_order_for(&p, &["nope".to_string()]),
            Err(StevedoreError::ServiceNotFound(_))
        ));
    }

    #[test]
    fn test_db_precedes_api_in_shipped_descriptor() {
        let env = Environment::new()
            .with("FORWARD_PORT", "8080")
            .with("CONTAINER_PORT", "80")
            .with("DB_USER", "alice")
            .with("DB_PASSWORD", "secret")
            .with("DB_NAME", "quickdish")
            .with("DB_PORT", "5432")
            .with("JWT_SECRET", "s");
        let parsed =
            ComposeParser::parse_str(include_str!("../../deploy/compose.yaml"), &env).unwrap();
        let p = Resolver::new(&env, Path::new("/srv/quickdish")).resolve(parsed).unwrap();

        assert_eq!(start_order(&p).unwrap(), vec!["db", "api"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let p = project(
            r#"
services:
  a:
    image: nginx
    depends_on: [b]
  b:
    image: nginx
    depends_on: [c]
  c:
    image: nginx
    depends_on: [a]
"#,
        );

        let err = start_order(&p).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.to_string(),
            "Configuration error: Circular dependency: a -> b -> c -> a"
        );
    }
}
