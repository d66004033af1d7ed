//! OF-023: Template sections — user-declared vectors in an object template.

use super::{DynTemplate, Vector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A `template_section { name, elements }` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateSection {
    pub name: String,
    #[serde(default)]
    pub elements: BTreeMap<String, String>,
}

impl TemplateSection {
    pub fn to_vector(&self) -> Vector {
        let mut vector = Vector::new(&self.name);
        for (key, value) in &self.elements {
            vector.add_pair(key, value);
        }
        vector
    }
}

/// Add sections to a template being built for creation.
pub fn add_sections(template: &mut DynTemplate, sections: &[TemplateSection]) {
    for section in sections {
        template.add_vector(section.to_vector());
    }
}

/// Delete every vector named by an old or new section, then add the new
/// sections. Returns true when the template changed.
pub fn reconcile_sections(
    template: &mut DynTemplate,
    old: &[TemplateSection],
    new: &[TemplateSection],
) -> bool {
    if old == new {
        return false;
    }
    for section in old.iter().chain(new) {
        template.del(&section.name);
    }
    add_sections(template, new);
    true
}

/// Read back the declared sections; names absent remotely are skipped.
pub fn read_sections(template: &DynTemplate, declared: &[TemplateSection]) -> Vec<TemplateSection> {
    declared
        .iter()
        .filter_map(|section| {
            template.get_vector(&section.name).map(|v| TemplateSection {
                name: section.name.clone(),
                elements: v
                    .pairs
                    .iter()
                    .map(|p| {
                        // Keep the declared key spelling when it matches.
                        let key = section
                            .elements
                            .keys()
                            .find(|k| k.eq_ignore_ascii_case(&p.key))
                            .cloned()
                            .unwrap_or_else(|| p.key.clone());
                        (key, p.value.clone())
                    })
                    .collect(),
            })
        })
        .collect()
}
