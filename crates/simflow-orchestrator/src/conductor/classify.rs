// Request classification
//
// Decision: Roles are admitted by an ordered rule table evaluated against the
// tokenized request, first rule matching a role wins. Matching is on whole
// tokens, so "md" never matches inside "cmd" and "flow" never inside
// "workflow".

use serde::{Deserialize, Serialize};
use simflow_core::TaskSpec;

/// Simulation domain handled by a performer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Finite-element structural analysis
    Structural,
    MolecularDynamics,
    /// Computational fluid dynamics
    Cfd,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Structural, Role::MolecularDynamics, Role::Cfd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Structural => "structural",
            Role::MolecularDynamics => "molecular_dynamics",
            Role::Cfd => "cfd",
        }
    }

    /// Execute node for this role
    pub fn node(&self) -> String {
        format!("execute:{}", self.as_str())
    }

    /// Default job for this role
    pub fn default_spec(&self) -> TaskSpec {
        match self {
            Role::Structural => TaskSpec::new("fenics", "fem_solve.py")
                .with_param("mesh_resolution", 32)
                .with_param("solver_tolerance", 1e-6)
                .with_param("element_order", 2)
                .with_param("cores", 4),
            Role::MolecularDynamics => TaskSpec::new("lammps", "md_run.in")
                .with_param("timestep_fs", 2.0)
                .with_param("steps", 100_000)
                .with_param("temperature_k", 300.0)
                .with_param("cores", 8)
                .with_param("gpus", 1),
            Role::Cfd => TaskSpec::new("openfoam", "simpleFoam")
                .with_param("mesh_resolution", 64)
                .with_param("solver_tolerance", 1e-5)
                .with_param("max_solver_iterations", 2000)
                .with_param("cores", 8),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token matcher for a classification rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Any of the phrases appears
    Any(Vec<String>),
    /// All of the phrases appear
    All(Vec<String>),
}

impl Matcher {
    pub fn any<I: IntoIterator<Item = S>, S: Into<String>>(phrases: I) -> Self {
        Matcher::Any(phrases.into_iter().map(Into::into).collect())
    }

    pub fn all<I: IntoIterator<Item = S>, S: Into<String>>(phrases: I) -> Self {
        Matcher::All(phrases.into_iter().map(Into::into).collect())
    }

    fn matches(&self, tokens: &[String]) -> bool {
        match self {
            Matcher::Any(phrases) => phrases.iter().any(|p| contains_phrase(tokens, p)),
            Matcher::All(phrases) => {
                !phrases.is_empty() && phrases.iter().all(|p| contains_phrase(tokens, p))
            }
        }
    }
}

/// One row of the classification table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRule {
    pub name: String,
    pub matcher: Matcher,
    pub role: Role,
}

impl ClassificationRule {
    pub fn new(name: impl Into<String>, matcher: Matcher, role: Role) -> Self {
        Self {
            name: name.into(),
            matcher,
            role,
        }
    }
}

/// Ordered request classifier
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<ClassificationRule>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(vec![
            ClassificationRule::new(
                "structural",
                Matcher::any([
                    "finite element",
                    "fem",
                    "fea",
                    "stress",
                    "strain",
                    "structural",
                    "deformation",
                    "beam",
                    "load bearing",
                ]),
                Role::Structural,
            ),
            ClassificationRule::new(
                "molecular-dynamics",
                Matcher::any([
                    "molecular dynamics",
                    "md",
                    "molecule",
                    "molecular",
                    "protein",
                    "atomistic",
                    "ligand",
                    "lammps",
                    "gromacs",
                ]),
                Role::MolecularDynamics,
            ),
            ClassificationRule::new(
                "cfd",
                Matcher::any([
                    "cfd",
                    "fluid",
                    "flow",
                    "aerodynamic",
                    "aerodynamics",
                    "turbulence",
                    "airfoil",
                    "drag",
                    "navier-stokes",
                ]),
                Role::Cfd,
            ),
            ClassificationRule::new(
                "fluid-structure-interaction",
                Matcher::all(["fluid", "structure"]),
                Role::Structural,
            ),
        ])
    }
}

impl Classifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    /// Roles admitted by the request, in rule order without duplicates
    pub fn classify(&self, request: &str) -> Vec<Role> {
        let tokens = tokenize(request);
        let mut roles = Vec::new();
        for rule in &self.rules {
            if !roles.contains(&rule.role) && rule.matcher.matches(&tokens) {
                tracing::debug!(rule = %rule.name, role = %rule.role, "classification rule matched");
                roles.push(rule.role);
            }
        }
        roles
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '-'))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn contains_phrase(tokens: &[String], phrase: &str) -> bool {
    let needle = tokenize(phrase);
    if needle.is_empty() || needle.len() > tokens.len() {
        return false;
    }
    tokens.windows(needle.len()).any(|window| window == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_domain() {
        let classifier = Classifier::default();
        assert_eq!(
            classifier.classify("Run a CFD simulation of the wing"),
            vec![Role::Cfd]
        );
        assert_eq!(
            classifier.classify("Protein folding with molecular dynamics"),
            vec![Role::MolecularDynamics]
        );
    }

    #[test]
    fn test_multi_domain_in_table_order() {
        let classifier = Classifier::default();
        let roles = classifier.classify("Coupled airflow and stress analysis: CFD then FEM, plus MD of the coating");
        assert_eq!(
            roles,
            vec![Role::Structural, Role::MolecularDynamics, Role::Cfd]
        );
    }

    #[test]
    fn test_whole_token_matching() {
        let classifier = Classifier::default();
        assert!(classifier.classify("Fix the cmd line workflow").is_empty());
        assert!(classifier.classify("").is_empty());
    }

    #[test]
    fn test_phrase_matching() {
        let tokens = tokenize("A finite-element model; finite element solver");
        assert!(contains_phrase(&tokens, "finite element"));
        assert!(!contains_phrase(&tokens, "element finite"));
    }

    #[test]
    fn test_classification_is_deterministic() {
        let classifier = Classifier::default();
        let request = "fluid structure interaction on a beam";
        let first = classifier.classify(request);
        for _ in 0..10 {
            assert_eq!(classifier.classify(request), first);
        }
        assert_eq!(first, vec![Role::Structural, Role::Cfd]);
    }

    #[test]
    fn test_default_specs() {
        let spec = Role::Structural.default_spec();
        assert_eq!(spec.tool, "fenics");
        assert_eq!(spec.script, "fem_solve.py");
        assert_eq!(spec.params["mesh_resolution"], 32);

        assert_eq!(Role::MolecularDynamics.default_spec().tool, "lammps");
        assert_eq!(Role::Cfd.default_spec().script, "simpleFoam");
        assert_eq!(Role::Cfd.node(), "execute:cfd");
    }
}
