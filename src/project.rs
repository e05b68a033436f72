//! Parsed object model for MSBuild project files.
//!
//! Reading is done by parsing into fully owned types via `roxmltree`.  The
//! model is deliberately unevaluated: conditions, `$(Property)` references
//! and wildcards are kept verbatim and resolved later by
//! [`crate::engine::Engine`].
//!
//! Every element kind the evaluator dispatches on is a variant of
//! [`ProjectElement`], so the two-pass walk over a project is an exhaustive
//! `match` instead of a chain of runtime type checks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::EvalError;

// ═══════════════════════════════════════════════════════════════════════════════
//  Project – root of the parsed model
// ═══════════════════════════════════════════════════════════════════════════════

/// Root representation of an MSBuild project file (`<Project>`).
#[derive(Debug, Clone)]
pub struct Project {
    /// Path the project was loaded from.
    pub file_name: PathBuf,
    /// Parent directory of [`file_name`](Self::file_name); relative paths in
    /// the file resolve against this.
    pub base_directory: PathBuf,
    /// The `Sdk` attribute of `<Project>`, if present (e.g.
    /// `"Microsoft.NET.Sdk"`); may name several SDKs separated by `;`.
    pub sdk: Option<String>,
    /// Top-level elements in document order.
    pub elements: Vec<ProjectElement>,
    /// Number of `<Import>` elements found while parsing.  Synthetic imports
    /// created during evaluation take ids starting here, so both evaluation
    /// passes assign the same ids.
    pub(crate) import_count: usize,
}

impl Project {
    /// Parse a project from its XML source string.  `file_name` is the path
    /// the source notionally lives at; it seeds the reserved
    /// `MSBuildProject*` properties and the base directory.
    pub fn parse(source: &str, file_name: impl Into<PathBuf>) -> Result<Self, EvalError> {
        let file_name = file_name.into();
        let doc = roxmltree::Document::parse(source).map_err(|e| EvalError::Xml {
            path: file_name.clone(),
            message: e.to_string(),
        })?;

        let root = doc.root_element();
        if root.tag_name().name() != "Project" {
            return Err(EvalError::invalid(
                &file_name,
                format!("root element is <{}>, expected <Project>", root.tag_name().name()),
            ));
        }

        let base_directory = file_name
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut reader = Reader { file_name: &file_name, next_import_id: 0 };
        let elements = reader.read_elements(root)?;

        Ok(Self {
            sdk: root.attribute("Sdk").map(str::to_string),
            elements,
            import_count: reader.next_import_id,
            file_name,
            base_directory,
        })
    }

    /// Load a project file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EvalError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| EvalError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&source, path)
    }

    /// The SDK names from the `Sdk` attribute, in declaration order.
    /// Each one produces an implicit `Sdk.props` / `Sdk.targets` import pair
    /// during evaluation.
    pub fn implicit_sdks(&self) -> Vec<&str> {
        self.sdk
            .as_deref()
            .map(|s| s.split(';').map(str::trim).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }

    /// The file name's stem, used for `$(MSBuildProjectName)`.
    pub fn name(&self) -> &str {
        self.file_name.file_stem().and_then(|s| s.to_str()).unwrap_or("")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Element kinds
// ═══════════════════════════════════════════════════════════════════════════════

/// One top-level (or `<When>`-nested) element of a project.
#[derive(Debug, Clone)]
pub enum ProjectElement {
    PropertyGroup(PropertyGroup),
    ItemGroup(ItemGroup),
    ItemDefinitionGroup(ItemGroup),
    Import(Import),
    ImportGroup(ImportGroup),
    Choose(Choose),
    Target(Target),
}

/// A `<PropertyGroup>`, optionally gated by a `Condition`.
#[derive(Debug, Clone, Default)]
pub struct PropertyGroup {
    pub condition: Option<String>,
    pub properties: Vec<Property>,
}

/// A single property element: `<Name Condition="...">value</Name>`.
#[derive(Debug, Clone)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub condition: Option<String>,
}

/// An `<ItemGroup>` or `<ItemDefinitionGroup>`.
#[derive(Debug, Clone, Default)]
pub struct ItemGroup {
    pub condition: Option<String>,
    pub items: Vec<Arc<Item>>,
}

/// A single item element.  Exactly one of `include`, `update` or `remove`
/// drives its behavior; `exclude` only applies alongside `include`.
///
/// Items are shared via [`Arc`] so evaluated items can keep back-references
/// to the source elements that produced them.
#[derive(Debug, Clone, Default)]
pub struct Item {
    pub name: String,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub update: Option<String>,
    pub remove: Option<String>,
    pub condition: Option<String>,
    /// Metadata child elements, in document order.
    pub metadata: Vec<Metadata>,
}

/// A metadata child element of an item.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub value: String,
    pub condition: Option<String>,
}

/// An `<Import>` element.
#[derive(Debug, Clone)]
pub struct Import {
    /// Reader-assigned id, unique within the owning project.  Pass 2 uses it
    /// to find the projects pass 1 resolved for this element.
    pub(crate) id: usize,
    /// The `Project` attribute: a path expression, possibly with properties
    /// and wildcards.
    pub project: String,
    /// The `Sdk` attribute for SDK-qualified imports.
    pub sdk: Option<String>,
    pub condition: Option<String>,
}

/// An `<ImportGroup>`.
#[derive(Debug, Clone, Default)]
pub struct ImportGroup {
    pub condition: Option<String>,
    pub imports: Vec<Import>,
}

/// A `<Choose>` element: `<When>` arms plus an optional `<Otherwise>`.
#[derive(Debug, Clone, Default)]
pub struct Choose {
    pub options: Vec<ChooseOption>,
}

/// One arm of a `<Choose>`.  `condition` is `None` for `<Otherwise>`.
#[derive(Debug, Clone, Default)]
pub struct ChooseOption {
    pub condition: Option<String>,
    pub elements: Vec<ProjectElement>,
}

impl ChooseOption {
    /// Whether this is the `<Otherwise>` arm.
    pub fn is_otherwise(&self) -> bool {
        self.condition.is_none()
    }
}

/// A `<Target>` element.  Attribute expressions stay unevaluated here and
/// are expanded when the target is evaluated; task children are carried
/// through untouched (this engine never executes them).
#[derive(Debug, Clone, Default)]
pub struct Target {
    pub name: String,
    pub condition: Option<String>,
    pub depends_on_targets: String,
    pub inputs: String,
    pub outputs: String,
    pub before_targets: String,
    pub after_targets: String,
    pub returns: String,
    pub keep_duplicate_outputs: String,
    pub tasks: Vec<TargetTask>,
}

/// A task invocation inside a `<Target>`, kept unevaluated.
#[derive(Debug, Clone, Default)]
pub struct TargetTask {
    pub name: String,
    pub condition: Option<String>,
    pub parameters: IndexMap<String, String>,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Reader
// ═══════════════════════════════════════════════════════════════════════════════

struct Reader<'a> {
    file_name: &'a Path,
    next_import_id: usize,
}

impl Reader<'_> {
    fn read_elements(
        &mut self,
        parent: roxmltree::Node<'_, '_>,
    ) -> Result<Vec<ProjectElement>, EvalError> {
        let mut elements = Vec::new();
        for node in parent.children().filter(|n| n.is_element()) {
            match node.tag_name().name() {
                "PropertyGroup" => {
                    elements.push(ProjectElement::PropertyGroup(read_property_group(node)));
                }
                "ItemGroup" => {
                    elements.push(ProjectElement::ItemGroup(read_item_group(node)));
                }
                "ItemDefinitionGroup" => {
                    elements.push(ProjectElement::ItemDefinitionGroup(read_item_group(node)));
                }
                "Import" => {
                    elements.push(ProjectElement::Import(self.read_import(node)?));
                }
                "ImportGroup" => {
                    let mut group = ImportGroup {
                        condition: attr(node, "Condition"),
                        imports: Vec::new(),
                    };
                    for child in node.children().filter(|n| n.is_element()) {
                        if child.tag_name().name() == "Import" {
                            group.imports.push(self.read_import(child)?);
                        }
                    }
                    elements.push(ProjectElement::ImportGroup(group));
                }
                "Choose" => {
                    elements.push(ProjectElement::Choose(self.read_choose(node)?));
                }
                "Target" => {
                    elements.push(ProjectElement::Target(self.read_target(node)?));
                }
                // ProjectExtensions, UsingTask, Sdk elements etc. carry no
                // evaluated state and are skipped.
                _ => {}
            }
        }
        Ok(elements)
    }

    fn read_import(&mut self, node: roxmltree::Node<'_, '_>) -> Result<Import, EvalError> {
        let project = node.attribute("Project").ok_or_else(|| {
            EvalError::invalid(self.file_name, "<Import> is missing the Project attribute")
        })?;
        let id = self.next_import_id;
        self.next_import_id += 1;
        Ok(Import {
            id,
            project: project.to_string(),
            sdk: attr(node, "Sdk"),
            condition: attr(node, "Condition"),
        })
    }

    fn read_choose(&mut self, node: roxmltree::Node<'_, '_>) -> Result<Choose, EvalError> {
        let mut choose = Choose::default();
        for child in node.children().filter(|n| n.is_element()) {
            match child.tag_name().name() {
                "When" => {
                    let condition = attr(child, "Condition");
                    if condition.is_none() {
                        return Err(EvalError::invalid(
                            self.file_name,
                            "<When> is missing the Condition attribute",
                        ));
                    }
                    choose.options.push(ChooseOption {
                        condition,
                        elements: self.read_elements(child)?,
                    });
                }
                "Otherwise" => {
                    choose.options.push(ChooseOption {
                        condition: None,
                        elements: self.read_elements(child)?,
                    });
                }
                _ => {}
            }
        }
        Ok(choose)
    }

    fn read_target(&mut self, node: roxmltree::Node<'_, '_>) -> Result<Target, EvalError> {
        let name = node.attribute("Name").ok_or_else(|| {
            EvalError::invalid(self.file_name, "<Target> is missing the Name attribute")
        })?;
        let mut target = Target {
            name: name.to_string(),
            condition: attr(node, "Condition"),
            depends_on_targets: attr_or_empty(node, "DependsOnTargets"),
            inputs: attr_or_empty(node, "Inputs"),
            outputs: attr_or_empty(node, "Outputs"),
            before_targets: attr_or_empty(node, "BeforeTargets"),
            after_targets: attr_or_empty(node, "AfterTargets"),
            returns: attr_or_empty(node, "Returns"),
            keep_duplicate_outputs: attr_or_empty(node, "KeepDuplicateOutputs"),
            tasks: Vec::new(),
        };
        for child in node.children().filter(|n| n.is_element()) {
            let mut task = TargetTask {
                name: child.tag_name().name().to_string(),
                condition: attr(child, "Condition"),
                parameters: IndexMap::new(),
            };
            for a in child.attributes() {
                if a.name() != "Condition" {
                    task.parameters.insert(a.name().to_string(), a.value().to_string());
                }
            }
            target.tasks.push(task);
        }
        Ok(target)
    }
}

fn read_property_group(node: roxmltree::Node<'_, '_>) -> PropertyGroup {
    let mut group = PropertyGroup { condition: attr(node, "Condition"), properties: Vec::new() };
    for child in node.children().filter(|n| n.is_element()) {
        group.properties.push(Property {
            name: child.tag_name().name().to_string(),
            value: child.text().unwrap_or("").to_string(),
            condition: attr(child, "Condition"),
        });
    }
    group
}

fn read_item_group(node: roxmltree::Node<'_, '_>) -> ItemGroup {
    let mut group = ItemGroup { condition: attr(node, "Condition"), items: Vec::new() };
    for child in node.children().filter(|n| n.is_element()) {
        let mut item = Item {
            name: child.tag_name().name().to_string(),
            include: attr(child, "Include"),
            exclude: attr(child, "Exclude"),
            update: attr(child, "Update"),
            remove: attr(child, "Remove"),
            condition: attr(child, "Condition"),
            metadata: Vec::new(),
        };
        for meta in child.children().filter(|n| n.is_element()) {
            item.metadata.push(Metadata {
                name: meta.tag_name().name().to_string(),
                value: meta.text().unwrap_or("").to_string(),
                condition: attr(meta, "Condition"),
            });
        }
        group.items.push(Arc::new(item));
    }
    group
}

fn attr(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name).map(str::to_string)
}

fn attr_or_empty(node: roxmltree::Node<'_, '_>, name: &str) -> String {
    node.attribute(name).unwrap_or("").to_string()
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════
