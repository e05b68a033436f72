//! Project evaluation engine.
//!
//! Evaluation runs in two passes over a project and everything it imports:
//! pass 1 resolves properties and imports in document order, pass 2 walks
//! the same tree again to evaluate item groups, item definitions and
//! targets.  Properties that referenced `@(...)` in pass 1 get a final
//! re-expansion once all items exist.
//!
//! Imported files are loaded through a shared [`ProjectCache`]; the handles
//! stay alive inside the evaluated state, so a re-evaluation reuses the
//! parsed imports and releases them only after the new result replaces the
//! old one.
//!
//! Conditions are fail-safe: a condition that cannot be parsed or evaluated
//! counts as false, and the error is logged at debug level.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};

use crate::cache::{ProjectCache, ProjectHandle};
use crate::condition::{
    collect_conditioned_properties, evaluate as evaluate_condition, matching_paren,
    parse_condition, ConditionScope, ConditionedProperties,
};
use crate::context::{EvaluationContext, ItemScope};
use crate::error::EvalError;
use crate::evaluated::{EvaluatedItem, EvaluatedTarget, MetadataValue, PropertyInfo};
use crate::glob::{
    is_wildcard, normalize_slashes, split_list, CompiledGlob, DirectoryExcludes, ExcludeSet,
    ExpandOptions,
};
use crate::project::{
    Choose, Import, Item, ItemGroup, Project, ProjectElement, PropertyGroup, Target,
};
use crate::sdk::{ImportSearchPath, SdkReference, SdkResolver};
use crate::transform::{
    execute_string_transform, execute_transform, parse_transform, TransformResult, TransformSpec,
};

// ═══════════════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Evaluates projects.  One engine can serve many [`ProjectInstance`]s and
/// shares parsed imports between them.
#[derive(Default)]
pub struct Engine {
    cache: ProjectCache,
    sdk_resolver: Option<Box<dyn SdkResolver>>,
    import_search_paths: Vec<ImportSearchPath>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the SDK resolver used for `Sdk` attributes.
    pub fn with_sdk_resolver(mut self, resolver: Box<dyn SdkResolver>) -> Self {
        self.sdk_resolver = Some(resolver);
        self
    }

    /// Register a fallback location list for imports that reference the
    /// given property.
    pub fn add_import_search_path(&mut self, search_path: ImportSearchPath) {
        self.import_search_paths.push(search_path);
    }

    pub fn cache(&self) -> &ProjectCache {
        &self.cache
    }

    /// Create an evaluatable instance of a parsed project.
    pub fn create_instance(&self, project: Arc<Project>) -> ProjectInstance {
        ProjectInstance {
            project,
            global_properties: IndexMap::new(),
            info: ProjectInfo::default(),
        }
    }

    /// Evaluate an instance, replacing its previous results.  With
    /// `only_properties` the item pass is skipped and item state comes back
    /// empty.
    pub fn evaluate(
        &self,
        instance: &mut ProjectInstance,
        only_properties: bool,
    ) -> Result<(), EvalError> {
        // Keep the previous import handles alive until the new evaluation
        // has its own; shared files are reused instead of re-parsed.
        let old_info = std::mem::take(&mut instance.info);
        let evaluation =
            Evaluation::new(self, instance.project.clone(), &instance.global_properties);
        let result = evaluation.run(only_properties);
        drop(old_info);
        instance.info = result?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Instance and evaluated state
// ═══════════════════════════════════════════════════════════════════════════════

/// A project plus its global properties and its latest evaluation results.
pub struct ProjectInstance {
    project: Arc<Project>,
    global_properties: IndexMap<String, String>,
    info: ProjectInfo,
}

impl ProjectInstance {
    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    /// Set a global property; takes effect on the next evaluation.
    pub fn set_global_property(&mut self, name: &str, value: &str) {
        self.global_properties.insert(name.to_string(), value.to_string());
    }

    pub fn remove_global_property(&mut self, name: &str) {
        self.global_properties.shift_remove(name);
    }

    pub fn global_properties(&self) -> impl Iterator<Item = (&str, &str)> {
        self.global_properties.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn evaluated_properties(&self) -> impl Iterator<Item = &PropertyInfo> {
        self.info.properties.values()
    }

    pub fn property(&self, name: &str) -> Option<&PropertyInfo> {
        self.info.properties.get(&name.to_ascii_lowercase())
    }

    /// The expanded value of a property, if defined.
    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.property(name).map(|p| p.final_value.as_str())
    }

    pub fn evaluated_items(&self) -> &[EvaluatedItem] {
        &self.info.items
    }

    pub fn items_ignoring_condition(&self) -> &[EvaluatedItem] {
        &self.info.items_ignoring_condition
    }

    /// Default metadata for an item type, from `<ItemDefinitionGroup>`.
    pub fn item_definition(&self, item_type: &str) -> Option<&IndexMap<String, MetadataValue>> {
        self.info.item_definitions.get(&item_type.to_ascii_lowercase())
    }

    pub fn targets(&self) -> &[EvaluatedTarget] {
        &self.info.targets
    }

    pub fn targets_ignoring_condition(&self) -> &[EvaluatedTarget] {
        &self.info.targets_ignoring_condition
    }

    pub fn conditioned_properties(&self) -> &ConditionedProperties {
        &self.info.conditioned_properties
    }

    /// The include globs whose pattern covers `file` and whose excludes do
    /// not reject it.
    pub fn find_glob_items_including_file(&self, file: &Path) -> Vec<&GlobInfo> {
        let include = self.include_text(file);
        self.info.globs.iter().filter(|g| g.matches_file(&include)).collect()
    }

    /// The `Update` items whose wildcard covers `file`, via the globs it
    /// belongs to.
    pub fn find_update_glob_items_including_file(&self, file: &Path) -> Vec<Arc<Item>> {
        let include = self.include_text(file);
        self.info
            .globs
            .iter()
            .flat_map(|g| &g.updates)
            .filter(|u| u.glob.matches(&include))
            .map(|u| u.item.clone())
            .collect()
    }

    /// A file path in the flavor item includes use: relative to the project
    /// directory when possible.
    fn include_text(&self, file: &Path) -> String {
        match file.strip_prefix(&self.project.base_directory) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => file.to_string_lossy().replace('\\', "/"),
        }
    }
}

/// The results of one evaluation.
#[derive(Default)]
pub(crate) struct ProjectInfo {
    /// Keyed by lowercased name.
    properties: IndexMap<String, PropertyInfo>,
    items: Vec<EvaluatedItem>,
    items_ignoring_condition: Vec<EvaluatedItem>,
    /// Keyed by lowercased item type.
    item_definitions: IndexMap<String, IndexMap<String, MetadataValue>>,
    targets: Vec<EvaluatedTarget>,
    targets_ignoring_condition: Vec<EvaluatedTarget>,
    conditioned_properties: ConditionedProperties,
    globs: Vec<GlobInfo>,
    /// Keeps imported files cached until the next evaluation.
    referenced_handles: Vec<ProjectHandle>,
}

/// A wildcard include recorded during evaluation, with the excludes and
/// updates that apply to it.
#[derive(Debug)]
pub struct GlobInfo {
    /// The source `<ItemName Include="...">` element.
    pub item: Arc<Item>,
    /// Item type.
    pub name: String,
    /// The expanded include pattern, one entry of the include list.
    pub include: String,
    glob: CompiledGlob,
    excludes: ExcludeSet,
    updates: Vec<UpdateGlob>,
    /// Frame of the file that declared the glob.
    frame_id: usize,
    pub is_imported: bool,
}

impl GlobInfo {
    /// Whether the glob would produce this include value.
    pub fn matches_file(&self, include: &str) -> bool {
        self.glob.matches(include) && !self.excludes.matches(include)
    }
}

#[derive(Debug)]
struct UpdateGlob {
    item: Arc<Item>,
    glob: CompiledGlob,
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Evaluation state
// ═══════════════════════════════════════════════════════════════════════════════

/// The import tree pass 1 resolved, reused by pass 2: import element id to
/// the files it brought in.
type ImportMap = HashMap<usize, Vec<ResolvedImport>>;

struct ResolvedImport {
    handle: ProjectHandle,
    project: Arc<Project>,
    children: ImportMap,
    /// `MSBuildSDKsPath` value in effect while this file is evaluated, for
    /// SDK-resolved imports.
    sdks_path: Option<String>,
}

/// Item lists of one file being evaluated.  Each import gets its own frame;
/// popping a frame appends its items to the parent, so removes can reach
/// into every ancestor while the order of the final list stays the document
/// order.  The id survives the pop, letting glob records tell a still-active
/// ancestor apart from an already-merged sibling import.
#[derive(Default)]
struct ItemFrame {
    id: usize,
    items: Vec<EvaluatedItem>,
    items_ignoring: Vec<EvaluatedItem>,
}

struct Evaluation<'a> {
    engine: &'a Engine,
    project: Arc<Project>,
    ctx: EvaluationContext,
    info: ProjectInfo,
    frames: Vec<ItemFrame>,
    next_frame_id: usize,
    import_depth: usize,
    /// Canonical paths of imports currently being evaluated; a file already
    /// on the chain is skipped, so circular imports terminate.
    active_imports: HashSet<PathBuf>,
}

impl<'a> Evaluation<'a> {
    fn new(
        engine: &'a Engine,
        project: Arc<Project>,
        globals: &IndexMap<String, String>,
    ) -> Self {
        let ctx = EvaluationContext::new(&project.file_name);
        let mut this = Self {
            engine,
            project,
            ctx,
            info: ProjectInfo::default(),
            frames: vec![ItemFrame::default()],
            next_frame_id: 1,
            import_depth: 0,
            active_imports: HashSet::new(),
        };
        for (name, value) in globals {
            this.ctx.set_property(name, value);
            this.store_property(name, value, value);
        }
        this
    }

    fn run(mut self, only_properties: bool) -> Result<ProjectInfo, EvalError> {
        let (sdk_props, sdk_targets, user_import) = self.synthetic_imports();
        let mut imports = ImportMap::new();

        self.run_pass(&sdk_props, &sdk_targets, &user_import, &mut imports, false)?;
        if !only_properties {
            self.run_pass(&sdk_props, &sdk_targets, &user_import, &mut imports, true)?;
        }
        self.reexpand_transform_properties();

        if let Some(frame) = self.frames.pop() {
            self.info.items = frame.items;
            self.info.items_ignoring_condition = frame.items_ignoring;
        }
        let mut handles = Vec::new();
        collect_handles(imports, &mut handles);
        self.info.referenced_handles = handles;
        Ok(self.info)
    }

    /// One walk over the whole project: the implicit `Sdk.props` imports,
    /// the project's own elements, the implicit `Sdk.targets` imports, and
    /// the `.user` file last.
    fn run_pass(
        &mut self,
        sdk_props: &[Import],
        sdk_targets: &[Import],
        user_import: &Import,
        imports: &mut ImportMap,
        eval_items: bool,
    ) -> Result<(), EvalError> {
        let project = self.project.clone();
        for import in sdk_props {
            self.evaluate_import(import, imports, eval_items)?;
        }
        self.evaluate_elements(&project.elements, imports, eval_items)?;
        for import in sdk_targets {
            self.evaluate_import(import, imports, eval_items)?;
        }
        self.evaluate_import(user_import, imports, eval_items)
    }

    /// The imports the project implies beyond its `<Import>` elements: one
    /// `Sdk.props`/`Sdk.targets` pair per SDK named in the `Sdk` attribute,
    /// and the sibling `.user` settings file.  Their ids continue after the
    /// reader-assigned ones, so both passes agree on them.
    fn synthetic_imports(&self) -> (Vec<Import>, Vec<Import>, Import) {
        let mut props = Vec::new();
        let mut targets = Vec::new();
        let mut id = self.project.import_count;
        for sdk in self.project.implicit_sdks() {
            props.push(Import {
                id,
                project: "Sdk.props".into(),
                sdk: Some(sdk.to_string()),
                condition: None,
            });
            id += 1;
            targets.push(Import {
                id,
                project: "Sdk.targets".into(),
                sdk: Some(sdk.to_string()),
                condition: None,
            });
            id += 1;
        }
        let user = Import {
            id,
            project: format!("{}.user", self.project.file_name.to_string_lossy().replace('\\', "/")),
            sdk: None,
            condition: None,
        };
        (props, targets, user)
    }

    fn evaluate_elements(
        &mut self,
        elements: &[ProjectElement],
        imports: &mut ImportMap,
        eval_items: bool,
    ) -> Result<(), EvalError> {
        for element in elements {
            match element {
                ProjectElement::PropertyGroup(group) if !eval_items => {
                    self.evaluate_property_group(group);
                }
                ProjectElement::ItemGroup(group) if eval_items => {
                    self.evaluate_item_group(group);
                }
                ProjectElement::ItemDefinitionGroup(group) if eval_items => {
                    self.evaluate_item_definition_group(group);
                }
                ProjectElement::Target(target) if eval_items => {
                    self.evaluate_target(target);
                }
                ProjectElement::Import(import) => {
                    self.evaluate_import(import, imports, eval_items)?;
                }
                ProjectElement::ImportGroup(group) => {
                    if self.safe_condition(group.condition.as_deref(), true, None, None) {
                        for import in &group.imports {
                            self.evaluate_import(import, imports, eval_items)?;
                        }
                    }
                }
                ProjectElement::Choose(choose) => {
                    self.evaluate_choose(choose, imports, eval_items)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ── Properties ───────────────────────────────────────────────────────

    fn evaluate_property_group(&mut self, group: &PropertyGroup) {
        if !self.safe_condition(group.condition.as_deref(), true, None, None) {
            return;
        }
        for prop in &group.properties {
            if !self.safe_condition(prop.condition.as_deref(), true, None, None) {
                continue;
            }
            let evaluated = self.ctx.evaluate(&prop.value);
            if evaluated.needs_items {
                self.ctx.note_transform_property(&prop.name);
            }
            self.ctx.set_property(&prop.name, &evaluated.text);
            self.store_property(&prop.name, &prop.value, &evaluated.text);
        }
    }

    fn store_property(&mut self, name: &str, value: &str, final_value: &str) {
        let is_imported = self.import_depth > 0;
        match self.info.properties.entry(name.to_ascii_lowercase()) {
            indexmap::map::Entry::Occupied(mut entry) => {
                let prop = entry.get_mut();
                prop.value = value.to_string();
                prop.final_value = final_value.to_string();
                prop.is_imported = is_imported;
                prop.defined_multiple_times = true;
            }
            indexmap::map::Entry::Vacant(entry) => {
                let mut prop = PropertyInfo::new(name, value, final_value);
                prop.is_imported = is_imported;
                entry.insert(prop);
            }
        }
    }

    /// Properties whose value held an `@(...)` reference get their final
    /// value from a re-expansion against the finished item lists.  Pass 1
    /// already expanded the `$(...)` references at their declaration point,
    /// so only the item references are outstanding.
    fn reexpand_transform_properties(&mut self) {
        let names: Vec<String> = self.ctx.transform_properties().map(str::to_string).collect();
        for name in names {
            let key = name.to_ascii_lowercase();
            let Some(snapshot) = self.info.properties.get(&key).map(|p| p.final_value.clone())
            else {
                continue;
            };
            let expanded = {
                let items = self.frames.last().map(|f| f.items.as_slice()).unwrap_or(&[]);
                expand_item_refs(&snapshot, items, &self.ctx, self.ctx.project_directory())
            };
            self.ctx.set_property(&name, &expanded);
            if let Some(prop) = self.info.properties.get_mut(&key) {
                prop.final_value = expanded;
            }
        }
    }

    fn expand_with_items(&self, text: &str) -> String {
        let evaluated = self.ctx.evaluate(text);
        if !evaluated.needs_items {
            return evaluated.text;
        }
        let items = self.frames.last().map(|f| f.items.as_slice()).unwrap_or(&[]);
        expand_item_refs(&evaluated.text, items, &self.ctx, self.ctx.project_directory())
    }

    // ── Imports ──────────────────────────────────────────────────────────

    fn evaluate_import(
        &mut self,
        import: &Import,
        imports: &mut ImportMap,
        eval_items: bool,
    ) -> Result<(), EvalError> {
        if eval_items {
            self.import_pass_items(import, imports)
        } else {
            self.import_pass_properties(import, imports)
        }
    }

    /// Pass 1: resolve the import, load the files and evaluate their
    /// properties, recording the resolved tree for pass 2.
    fn import_pass_properties(
        &mut self,
        import: &Import,
        imports: &mut ImportMap,
    ) -> Result<(), EvalError> {
        let handles = self.resolve_import_files(import)?;
        if handles.is_empty() {
            return Ok(());
        }
        let mut resolved = Vec::new();
        for (handle, sdks_path) in handles {
            let project = handle.project().clone();
            let path = handle.path().to_path_buf();
            if !self.active_imports.insert(path.clone()) {
                debug!("skipping circular import {}", path.display());
                continue;
            }
            let mut children = ImportMap::new();
            self.ctx.push_file_scope(&path);
            if let Some(sdks) = &sdks_path {
                self.ctx.push_override_scope(&[("MSBuildSDKsPath", sdks.as_str())]);
            }
            self.import_depth += 1;
            let result = self.evaluate_elements(&project.elements, &mut children, false);
            self.import_depth -= 1;
            if sdks_path.is_some() {
                self.ctx.pop_scope();
            }
            self.ctx.pop_scope();
            self.active_imports.remove(&path);
            result?;
            resolved.push(ResolvedImport { handle, project, children, sdks_path });
        }
        imports.insert(import.id, resolved);
        Ok(())
    }

    /// Pass 2: walk the files pass 1 resolved and evaluate their items and
    /// targets, each file in its own item frame.
    fn import_pass_items(
        &mut self,
        import: &Import,
        imports: &mut ImportMap,
    ) -> Result<(), EvalError> {
        let Some(resolved) = imports.get_mut(&import.id) else {
            return Ok(());
        };
        for child in resolved.iter_mut() {
            let project = child.project.clone();
            let path = child.handle.path().to_path_buf();
            let sdks_path = child.sdks_path.clone();
            self.ctx.push_file_scope(&path);
            if let Some(sdks) = &sdks_path {
                self.ctx.push_override_scope(&[("MSBuildSDKsPath", sdks.as_str())]);
            }
            self.import_depth += 1;
            self.push_frame();
            let result = self.evaluate_elements(&project.elements, &mut child.children, true);
            self.pop_frame();
            self.import_depth -= 1;
            if sdks_path.is_some() {
                self.ctx.pop_scope();
            }
            self.ctx.pop_scope();
            result?;
        }
        Ok(())
    }

    fn push_frame(&mut self) {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frames.push(ItemFrame { id, ..ItemFrame::default() });
    }

    fn pop_frame(&mut self) {
        if let Some(frame) = self.frames.pop() {
            if let Some(parent) = self.frames.last_mut() {
                parent.items.extend(frame.items);
                parent.items_ignoring.extend(frame.items_ignoring);
            }
        }
    }

    /// Resolve an import spec to loaded files.  SDK imports go through the
    /// resolver; ordinary specs resolve against the current file's
    /// directory, with the registered search paths as fallback when the
    /// spec references one of their properties.  A missing file or a false
    /// condition resolves to nothing.  SDK files come back with the
    /// `MSBuildSDKsPath` value to put in scope while they are evaluated.
    fn resolve_import_files(
        &mut self,
        import: &Import,
    ) -> Result<Vec<(ProjectHandle, Option<String>)>, EvalError> {
        let engine = self.engine;

        if let Some(sdk_spec) = &import.sdk {
            let mut handles = Vec::new();
            for name in split_list(sdk_spec) {
                let Some(sdk) = SdkReference::parse(name) else {
                    warn!("invalid sdk reference '{name}'");
                    continue;
                };
                let Some(resolver) = &engine.sdk_resolver else {
                    debug!("no sdk resolver registered, skipping sdk '{name}'");
                    continue;
                };
                let Some(sdk_dir) = resolver.resolve(&sdk, &self.project.file_name) else {
                    debug!("sdk '{name}' did not resolve");
                    continue;
                };
                // The SDKs root is two levels above <root>/<name>/Sdk.
                let sdks_path = sdk_dir
                    .parent()
                    .and_then(Path::parent)
                    .map(|root| root.to_string_lossy().replace('\\', "/"));
                if let Some(found) = self.try_import_candidate(import, &sdk_dir, Some(&sdk_dir))? {
                    handles.extend(found.into_iter().map(|h| (h, sdks_path.clone())));
                }
            }
            return Ok(handles);
        }

        let current = self.ctx.current_directory();
        if let Some(found) = self.try_import_candidate(import, &current, None)? {
            return Ok(found.into_iter().map(|h| (h, None)).collect());
        }
        for search in &engine.import_search_paths {
            if !spec_references_property(&import.project, &search.property) {
                continue;
            }
            for dir in &search.paths {
                let dir_text = dir.to_string_lossy().replace('\\', "/");
                self.ctx.push_override_scope(&[(search.property.as_str(), dir_text.as_str())]);
                let result = self.try_import_candidate(import, &current, Some(dir));
                self.ctx.pop_scope();
                if let Some(found) = result? {
                    return Ok(found.into_iter().map(|h| (h, None)).collect());
                }
            }
        }
        Ok(Vec::new())
    }

    /// Try one resolution base.  `Ok(None)` means keep searching: a false
    /// condition, an empty spec, or no file at the resolved location.
    fn try_import_candidate(
        &mut self,
        import: &Import,
        base_dir: &Path,
        condition_base: Option<&Path>,
    ) -> Result<Option<Vec<ProjectHandle>>, EvalError> {
        if !self.safe_condition(import.condition.as_deref(), true, condition_base, None) {
            return Ok(None);
        }
        let spec = normalize_slashes(self.ctx.evaluate(&import.project).text.trim());
        if spec.is_empty() {
            return Ok(None);
        }

        if is_wildcard(&spec) {
            let glob = CompiledGlob::compile(&spec);
            let matches = glob.expand(base_dir, &ExpandOptions::default());
            if matches.is_empty() {
                return Ok(None);
            }
            let mut handles = Vec::new();
            for m in matches {
                let path = resolve_path(base_dir, &m.include);
                handles.push(self.engine.cache.acquire(&path)?);
            }
            return Ok(Some(handles));
        }

        let path = resolve_path(base_dir, &spec);
        if !path.is_file() {
            debug!("import '{}' not found at {}", import.project, path.display());
            return Ok(None);
        }
        Ok(Some(vec![self.engine.cache.acquire(&path)?]))
    }

    // ── Items ────────────────────────────────────────────────────────────

    fn evaluate_item_group(&mut self, group: &ItemGroup) {
        let group_cond = self.safe_condition(group.condition.as_deref(), false, None, None);
        for item in &group.items {
            let item_cond = self.safe_condition(item.condition.as_deref(), false, None, None);
            let true_cond = group_cond && item_cond;
            // Condition-false operations still touch the
            // ignoring-condition list.
            if let Some(update) = &item.update {
                self.apply_update(item, update, true_cond);
            } else if let Some(remove) = &item.remove {
                self.apply_remove(item, remove, true_cond);
            } else if let Some(include) = &item.include {
                self.apply_include(item, include, true_cond);
            }
        }
    }

    fn evaluate_item_definition_group(&mut self, group: &ItemGroup) {
        if !self.safe_condition(group.condition.as_deref(), true, None, None) {
            return;
        }
        for item in &group.items {
            if !self.safe_condition(item.condition.as_deref(), true, None, None) {
                continue;
            }
            for meta in &item.metadata {
                if !self.safe_condition(meta.condition.as_deref(), true, None, None) {
                    continue;
                }
                let value = self.ctx.evaluate(&meta.value).text;
                self.info
                    .item_definitions
                    .entry(item.name.to_ascii_lowercase())
                    .or_default()
                    .insert(meta.name.clone(), MetadataValue::new(&meta.value, &value));
            }
        }
    }

    fn apply_include(&mut self, source: &Arc<Item>, include: &str, true_cond: bool) {
        let text = normalize_slashes(&self.ctx.evaluate(include).text);
        let exclude_text = match &source.exclude {
            Some(exclude) => normalize_slashes(&self.ctx.evaluate(exclude).text),
            None => String::new(),
        };
        let excludes = ExcludeSet::new(&exclude_text);
        let dir_excludes = DirectoryExcludes::from_exclude_spec(&exclude_text);

        let parts: Vec<String> = split_list(&text).map(str::to_string).collect();
        for part in parts {
            if part.starts_with("@(") {
                if let Some(spec) = parse_transform(&part) {
                    self.add_items_from_transform(source, &part, &spec, true_cond, &excludes);
                    continue;
                }
            }
            if part.contains("@(") {
                // Mixed text with embedded item references: expand to a
                // plain list first.
                let expanded = {
                    let items = self.current_items();
                    expand_item_refs(&part, items, &self.ctx, self.ctx.project_directory())
                };
                let subs: Vec<String> = split_list(&expanded).map(str::to_string).collect();
                for sub in subs {
                    self.add_plain_item(source, &sub, true_cond, &excludes);
                }
            } else if is_wildcard(&part) {
                self.add_items_from_glob(source, &part, true_cond, &excludes, &dir_excludes);
            } else {
                self.add_plain_item(source, &part, true_cond, &excludes);
            }
        }
    }

    fn add_plain_item(
        &mut self,
        source: &Arc<Item>,
        include: &str,
        true_cond: bool,
        excludes: &ExcludeSet,
    ) {
        if excludes.matches(include) {
            return;
        }
        let mut item = self.new_item(source, include);
        self.apply_element_metadata(&mut item, source);
        self.push_item(item, true_cond);
    }

    fn add_items_from_glob(
        &mut self,
        source: &Arc<Item>,
        pattern: &str,
        true_cond: bool,
        excludes: &ExcludeSet,
        dir_excludes: &DirectoryExcludes,
    ) {
        let glob = CompiledGlob::compile(pattern);
        let base = self.ctx.project_directory().to_path_buf();
        let options = ExpandOptions {
            excludes: (!excludes.is_empty()).then_some(excludes),
            directory_excludes: (!dir_excludes.is_empty()).then_some(dir_excludes),
        };
        for m in glob.expand(&base, &options) {
            let mut item = self.new_item(source, &m.include);
            item.recursive_dir = m.recursive_dir;
            self.apply_element_metadata(&mut item, source);
            self.push_item(item, true_cond);
        }
        if true_cond {
            self.info.globs.push(GlobInfo {
                item: source.clone(),
                name: source.name.clone(),
                include: pattern.to_string(),
                glob,
                excludes: excludes.clone(),
                updates: Vec::new(),
                frame_id: self.frames.last().map(|f| f.id).unwrap_or(0),
                is_imported: self.import_depth > 0,
            });
        }
    }

    fn add_items_from_transform(
        &mut self,
        source: &Arc<Item>,
        raw: &str,
        spec: &TransformSpec,
        true_cond: bool,
        excludes: &ExcludeSet,
    ) {
        let matched: Vec<EvaluatedItem> = self
            .current_items()
            .iter()
            .filter(|i| i.name.eq_ignore_ascii_case(&spec.item_name))
            .cloned()
            .collect();
        let base = self.ctx.project_directory().to_path_buf();
        let Some(result) = execute_transform(&matched, spec, &self.ctx, &base) else {
            debug!("transform '{raw}' produced no items");
            return;
        };

        let mut new_items = Vec::new();
        match result {
            TransformResult::Summary(value) => {
                new_items.push(self.new_item(source, &value));
            }
            TransformResult::Items { items, ignore_metadata } => {
                for transformed in items {
                    let mut item = self.new_item(source, &transformed.include);
                    if !ignore_metadata {
                        item.metadata.extend(transformed.metadata);
                    }
                    new_items.push(item);
                }
            }
            TransformResult::PerItem(values) => {
                for (value, transformed) in values {
                    let mut item = self.new_item(source, &value);
                    item.metadata.extend(transformed.metadata);
                    new_items.push(item);
                }
            }
        }

        for mut item in new_items {
            if excludes.matches(&item.include) {
                continue;
            }
            self.apply_element_metadata(&mut item, source);
            self.push_item(item, true_cond);
        }
    }

    fn apply_update(&mut self, source: &Arc<Item>, update: &str, true_cond: bool) {
        let text = normalize_slashes(&self.ctx.evaluate(update).text);
        let parts: Vec<String> = split_list(&text).map(str::to_string).collect();
        for part in parts {
            let glob = is_wildcard(&part).then(|| CompiledGlob::compile(&part));
            if let Some(glob) = glob.as_ref().filter(|_| true_cond) {
                // Wildcard updates register on globs declared by the current
                // file and its ancestors, not by already-merged sibling
                // imports.
                let active: Vec<usize> = self.frames.iter().map(|f| f.id).collect();
                for g in self.info.globs.iter_mut().filter(|g| {
                    g.name.eq_ignore_ascii_case(&source.name) && active.contains(&g.frame_id)
                }) {
                    g.updates.push(UpdateGlob { item: source.clone(), glob: glob.clone() });
                }
            }
            for frame_index in 0..self.frames.len() {
                for ignoring in [false, true] {
                    if !ignoring && !true_cond {
                        continue;
                    }
                    let len = self.frame_list(frame_index, ignoring).len();
                    for item_index in 0..len {
                        let matched = {
                            let item = &self.frame_list(frame_index, ignoring)[item_index];
                            item.name.eq_ignore_ascii_case(&source.name)
                                && include_matches(&item.include, &part, glob.as_ref())
                        };
                        if !matched {
                            continue;
                        }
                        // Metadata may reference the target item via %(...),
                        // so each update is evaluated per item.  Wildcard
                        // updates from an imported file store the evaluated
                        // value as the raw value too.
                        let literal = glob.is_some() && self.import_depth > 0;
                        let mut item =
                            self.frame_list(frame_index, ignoring)[item_index].clone();
                        self.apply_metadata(&mut item, source, literal);
                        item.sources.push(source.clone());
                        self.frame_list_mut(frame_index, ignoring)[item_index] = item;
                    }
                }
            }
        }
    }

    fn apply_remove(&mut self, source: &Arc<Item>, remove: &str, true_cond: bool) {
        let text = normalize_slashes(&self.ctx.evaluate(remove).text);
        let parts: Vec<String> = split_list(&text).map(str::to_string).collect();
        for part in parts {
            let glob = is_wildcard(&part).then(|| CompiledGlob::compile(&part));
            let name = source.name.as_str();
            for frame in &mut self.frames {
                if true_cond {
                    frame.items.retain(|i| {
                        !(i.name.eq_ignore_ascii_case(name)
                            && include_matches(&i.include, &part, glob.as_ref()))
                    });
                }
                frame.items_ignoring.retain(|i| {
                    !(i.name.eq_ignore_ascii_case(name)
                        && include_matches(&i.include, &part, glob.as_ref()))
                });
            }
            if !true_cond {
                continue;
            }
            // Future queries against the recorded globs must not report the
            // removed files either.
            for g in self.info.globs.iter_mut().filter(|g| g.name.eq_ignore_ascii_case(name)) {
                g.excludes.add(&part);
            }
        }
    }

    fn new_item(&self, source: &Arc<Item>, include: &str) -> EvaluatedItem {
        let unevaluated = source.include.as_deref().unwrap_or(include);
        let mut item = EvaluatedItem::new(&source.name, unevaluated, include);
        item.condition = source.condition.clone();
        item.is_imported = self.import_depth > 0;
        item.metadata = self
            .info
            .item_definitions
            .get(&source.name.to_ascii_lowercase())
            .cloned()
            .unwrap_or_default();
        item.sources.push(source.clone());
        item
    }

    fn apply_element_metadata(&mut self, target: &mut EvaluatedItem, source: &Arc<Item>) {
        self.apply_metadata(target, source, false);
    }

    fn apply_metadata(&mut self, target: &mut EvaluatedItem, source: &Arc<Item>, literal: bool) {
        if source.metadata.is_empty() {
            return;
        }
        let base = self.ctx.project_directory().to_path_buf();
        for meta in &source.metadata {
            // Earlier metadata of the same element is visible to later ones.
            let snapshot = target.clone();
            let scope = ItemScope { item: &snapshot, base_directory: &base };
            if !self.safe_condition(meta.condition.as_deref(), true, None, Some(&scope)) {
                continue;
            }
            let value = self.ctx.evaluate_with(&meta.value, Some(&scope)).text;
            let unevaluated = if literal { value.as_str() } else { meta.value.as_str() };
            target.metadata.insert(meta.name.clone(), MetadataValue::new(unevaluated, &value));
        }
    }

    fn push_item(&mut self, item: EvaluatedItem, true_cond: bool) {
        let Some(frame) = self.frames.last_mut() else {
            return;
        };
        frame.items_ignoring.push(item.clone());
        if true_cond {
            frame.items.push(item);
        }
    }

    fn current_items(&self) -> &[EvaluatedItem] {
        self.frames.last().map(|f| f.items.as_slice()).unwrap_or(&[])
    }

    fn frame_list(&self, index: usize, ignoring: bool) -> &Vec<EvaluatedItem> {
        let frame = &self.frames[index];
        if ignoring { &frame.items_ignoring } else { &frame.items }
    }

    fn frame_list_mut(&mut self, index: usize, ignoring: bool) -> &mut Vec<EvaluatedItem> {
        let frame = &mut self.frames[index];
        if ignoring { &mut frame.items_ignoring } else { &mut frame.items }
    }

    // ── Targets and choose ───────────────────────────────────────────────

    fn evaluate_target(&mut self, target: &Target) {
        let cond = self.safe_condition(target.condition.as_deref(), false, None, None);
        let mut expanded = target.clone();
        for attr in [
            &mut expanded.name,
            &mut expanded.depends_on_targets,
            &mut expanded.inputs,
            &mut expanded.outputs,
            &mut expanded.before_targets,
            &mut expanded.after_targets,
            &mut expanded.returns,
            &mut expanded.keep_duplicate_outputs,
        ] {
            if attr.contains('$') || attr.contains('@') {
                *attr = self.expand_with_items(attr);
            }
        }
        let evaluated = EvaluatedTarget { target: expanded, is_imported: self.import_depth > 0 };
        self.info.targets_ignoring_condition.push(evaluated.clone());
        if cond {
            self.info.targets.push(evaluated);
        }
    }

    fn evaluate_choose(
        &mut self,
        choose: &Choose,
        imports: &mut ImportMap,
        eval_items: bool,
    ) -> Result<(), EvalError> {
        for option in &choose.options {
            if option.is_otherwise()
                || self.safe_condition(option.condition.as_deref(), true, None, None)
            {
                return self.evaluate_elements(&option.elements, imports, eval_items);
            }
        }
        Ok(())
    }

    // ── Conditions ───────────────────────────────────────────────────────

    /// Parse and evaluate a condition; errors count as false.  `collect`
    /// feeds equality comparisons into the conditioned-property table, and
    /// `base` overrides the directory `Exists(...)` resolves against.
    fn safe_condition(
        &mut self,
        condition: Option<&str>,
        collect: bool,
        base: Option<&Path>,
        item: Option<&ItemScope<'_>>,
    ) -> bool {
        let Some(text) = condition else {
            return true;
        };
        let text = text.trim();
        if text.is_empty() {
            return true;
        }
        let cond = match parse_condition(text) {
            Ok(cond) => cond,
            Err(e) => {
                debug!("treating condition as false: {e}");
                return false;
            }
        };
        if collect {
            collect_conditioned_properties(&cond, &mut self.info.conditioned_properties);
        }
        let env = ConditionEnv {
            ctx: &self.ctx,
            item,
            base,
            current_dir: self.ctx.current_directory(),
            items: self.frames.last().map(|f| f.items.as_slice()).unwrap_or(&[]),
            project_dir: self.ctx.project_directory(),
        };
        match evaluate_condition(&cond, &env) {
            Ok(result) => result,
            Err(e) => {
                debug!("treating condition '{text}' as false: {e}");
                false
            }
        }
    }
}

/// [`ConditionScope`] over the live evaluation state: properties from the
/// context, `@(...)` from the current item frame, `Exists(...)` relative to
/// the current (or overridden) directory.
struct ConditionEnv<'a> {
    ctx: &'a EvaluationContext,
    item: Option<&'a ItemScope<'a>>,
    base: Option<&'a Path>,
    current_dir: PathBuf,
    items: &'a [EvaluatedItem],
    project_dir: &'a Path,
}

impl ConditionScope for ConditionEnv<'_> {
    fn property(&self, name: &str) -> Option<String> {
        self.ctx.property(name)
    }

    fn expand(&self, raw: &str) -> String {
        let evaluated = self.ctx.evaluate_with(raw, self.item);
        if evaluated.needs_items {
            expand_item_refs(&evaluated.text, self.items, self.ctx, self.project_dir)
        } else {
            evaluated.text
        }
    }

    fn base_directory(&self) -> Option<&Path> {
        Some(self.base.unwrap_or(&self.current_dir))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Replace every complete `@(...)` reference in `text` with its transform
/// result; references that fail expand to nothing.
fn expand_item_refs(
    text: &str,
    items: &[EvaluatedItem],
    ctx: &EvaluationContext,
    base: &Path,
) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '@' && chars.get(i + 1) == Some(&'(') {
            if let Some(end) = matching_paren(&chars, i + 1) {
                let raw: String = chars[i..=end].iter().collect();
                if let Some(spec) = parse_transform(&raw) {
                    let matched: Vec<EvaluatedItem> = items
                        .iter()
                        .filter(|it| it.name.eq_ignore_ascii_case(&spec.item_name))
                        .cloned()
                        .collect();
                    if let Some(value) = execute_string_transform(&matched, &spec, ctx, base) {
                        out.push_str(&value);
                    }
                    i = end + 1;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn include_matches(include: &str, literal: &str, glob: Option<&CompiledGlob>) -> bool {
    match glob {
        Some(glob) => glob.matches(include),
        None => normalize_slashes(include) == literal,
    }
}

fn resolve_path(base_dir: &Path, spec: &str) -> PathBuf {
    let path = Path::new(spec);
    if path.is_absolute() { path.to_path_buf() } else { base_dir.join(path) }
}

fn spec_references_property(spec: &str, property: &str) -> bool {
    spec.to_ascii_lowercase().contains(&format!("$({})", property.to_ascii_lowercase()))
}

fn collect_handles(imports: ImportMap, out: &mut Vec<ProjectHandle>) {
    for (_, resolved) in imports {
        for child in resolved {
            out.push(child.handle);
            collect_handles(child.children, out);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::DirectorySdkResolver;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn instance(engine: &Engine, path: &Path) -> ProjectInstance {
        let project = Arc::new(Project::from_file(path).unwrap());
        engine.create_instance(project)
    }

    fn evaluated(dir: &Path, body: &str) -> ProjectInstance {
        let path = write(dir, "app.csproj", &format!("<Project>{body}</Project>"));
        let engine = Engine::new();
        let mut inst = instance(&engine, &path);
        engine.evaluate(&mut inst, false).unwrap();
        inst
    }

    fn item_includes(items: &[EvaluatedItem], name: &str) -> Vec<String> {
        items.iter().filter(|i| i.name == name).map(|i| i.include.clone()).collect()
    }

    // ── Properties ───────────────────────────────────────────────────────

    #[test]
    fn properties_layer_with_imports() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "common.props",
            r#"<Project>
                 <PropertyGroup>
                   <OutDir>from-import</OutDir>
                   <ImportOnly>yes</ImportOnly>
                 </PropertyGroup>
               </Project>"#,
        );
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup><OutDir>initial</OutDir></PropertyGroup>
               <Import Project="common.props" />
               <PropertyGroup><OutDir>final</OutDir></PropertyGroup>"#,
        );

        let out_dir = inst.property("OutDir").unwrap();
        assert_eq!(out_dir.final_value, "final");
        assert!(out_dir.defined_multiple_times);
        assert!(!out_dir.is_imported);

        let import_only = inst.property("ImportOnly").unwrap();
        assert_eq!(import_only.final_value, "yes");
        assert!(import_only.is_imported);
        assert!(!import_only.defined_multiple_times);
    }

    #[test]
    fn global_properties_seed_the_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            dir.path(),
            "app.csproj",
            r#"<Project>
                 <PropertyGroup Condition="'$(Configuration)'=='Release'">
                   <Optimize>true</Optimize>
                 </PropertyGroup>
               </Project>"#,
        );
        let engine = Engine::new();
        let mut inst = instance(&engine, &path);
        inst.set_global_property("Configuration", "Release");
        engine.evaluate(&mut inst, false).unwrap();

        assert_eq!(inst.property_value("Optimize"), Some("true"));
        assert_eq!(inst.property_value("Configuration"), Some("Release"));
    }

    #[test]
    fn unparsable_condition_counts_as_false() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup Condition="'$(X)' >"><Broken>1</Broken></PropertyGroup>
               <PropertyGroup><Fine>1</Fine></PropertyGroup>"#,
        );
        assert_eq!(inst.property_value("Broken"), None);
        assert_eq!(inst.property_value("Fine"), Some("1"));
    }

    #[test]
    fn conditioned_properties_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup Condition="'$(Configuration)|$(Platform)'=='Debug|x64'">
                 <A>1</A>
               </PropertyGroup>
               <PropertyGroup Condition="'$(Configuration)'=='Release'"><B>1</B></PropertyGroup>"#,
        );
        let props = inst.conditioned_properties();
        assert_eq!(
            props.property_values("Configuration"),
            Some(&["Debug".to_string(), "Release".to_string()][..])
        );
        assert_eq!(props.property_values("Platform"), Some(&["x64".to_string()][..]));
    }

    #[test]
    fn property_referencing_items_gets_deferred_expansion() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup><FileCount>@(Compile->Count())</FileCount></PropertyGroup>
               <ItemGroup>
                 <Compile Include="a.cs" />
                 <Compile Include="b.cs" />
               </ItemGroup>"#,
        );
        assert_eq!(inst.property_value("FileCount"), Some("2"));
    }

    #[test]
    fn deferred_expansion_keeps_declaration_point_properties() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup>
                 <Suffix>x</Suffix>
                 <Summary>@(Compile->Count())-$(Suffix)</Summary>
                 <Suffix>y</Suffix>
               </PropertyGroup>
               <ItemGroup><Compile Include="a.cs" /></ItemGroup>"#,
        );
        // Only the item reference waits for pass 2; $(Suffix) keeps the
        // value it had where Summary was declared.
        assert_eq!(inst.property_value("Summary"), Some("1-x"));
        assert_eq!(inst.property_value("Suffix"), Some("y"));
    }

    // ── Items ────────────────────────────────────────────────────────────

    #[test]
    fn glob_include_with_exclude() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        write(dir.path(), "sub/b.cs", "");
        write(dir.path(), "sub/deep/c.cs", "");
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup><Compile Include="**/*.cs" Exclude="sub/**" /></ItemGroup>"#,
        );
        assert_eq!(item_includes(inst.evaluated_items(), "Compile"), vec!["a.cs"]);

        let globs = inst.find_glob_items_including_file(&dir.path().join("other.cs"));
        assert_eq!(globs.len(), 1);
        assert_eq!(globs[0].name, "Compile");
        assert!(inst.find_glob_items_including_file(&dir.path().join("sub/x.cs")).is_empty());
    }

    #[test]
    fn recursive_dir_metadata_from_glob() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "res/img/icon.png", "");
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Content Include="res/**/*.png"><Link>%(RecursiveDir)%(Filename)</Link></Content>
               </ItemGroup>"#,
        );
        let item = &inst.evaluated_items()[0];
        assert_eq!(item.include, "res/img/icon.png");
        assert_eq!(item.recursive_dir, "img/");
        assert_eq!(item.metadata_value("Link"), Some("img/icon"));
    }

    #[test]
    fn update_applies_metadata_to_both_lists() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        write(dir.path(), "sub/b.cs", "");
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="**/*.cs" />
                 <Compile Update="sub/b.cs"><Foo>1</Foo></Compile>
               </ItemGroup>"#,
        );
        for list in [inst.evaluated_items(), inst.items_ignoring_condition()] {
            let a = list.iter().find(|i| i.include == "a.cs").unwrap();
            let b = list.iter().find(|i| i.include == "sub/b.cs").unwrap();
            assert_eq!(a.metadata_value("Foo"), None);
            assert_eq!(b.metadata_value("Foo"), Some("1"));
        }
    }

    #[test]
    fn wildcard_update_registers_on_globs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="**/*.cs" />
                 <Compile Update="**/a*.cs"><Gen>true</Gen></Compile>
               </ItemGroup>"#,
        );
        assert_eq!(
            inst.evaluated_items()[0].metadata_value("Gen"),
            Some("true")
        );
        let updates = inst.find_update_glob_items_including_file(&dir.path().join("abc.cs"));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].update.as_deref(), Some("**/a*.cs"));
        assert!(inst.find_update_glob_items_including_file(&dir.path().join("z.cs")).is_empty());
    }

    #[test]
    fn wildcard_update_skips_sibling_import_globs() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        write(dir.path(), "extra/b.cs", "");
        write(
            dir.path(),
            "sibling.props",
            r#"<Project><ItemGroup><Compile Include="extra/**/*.cs" /></ItemGroup></Project>"#,
        );
        write(
            dir.path(),
            "updates.props",
            r#"<Project>
                 <ItemGroup><Compile Update="**/*.cs"><Gen>true</Gen></Compile></ItemGroup>
               </Project>"#,
        );
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup><Compile Include="*.cs" /></ItemGroup>
               <Import Project="sibling.props" />
               <Import Project="updates.props" />"#,
        );
        // The metadata itself reaches items from every file.
        for include in ["a.cs", "extra/b.cs"] {
            let item = inst.evaluated_items().iter().find(|i| i.include == include).unwrap();
            assert_eq!(item.metadata_value("Gen"), Some("true"));
        }
        // The update registers on the root glob only; the glob declared by
        // the already-finished sibling import is not the updating file's
        // ancestor.
        let updates = inst.find_update_glob_items_including_file(&dir.path().join("z.cs"));
        assert_eq!(updates.len(), 1);
    }

    #[test]
    fn remove_deletes_items_and_future_glob_matches() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        write(dir.path(), "b.cs", "");
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="*.cs" />
                 <Compile Remove="b.cs" />
               </ItemGroup>"#,
        );
        assert_eq!(item_includes(inst.evaluated_items(), "Compile"), vec!["a.cs"]);
        assert_eq!(item_includes(inst.items_ignoring_condition(), "Compile"), vec!["a.cs"]);
        // The recorded glob no longer reports the removed file either.
        assert!(inst.find_glob_items_including_file(&dir.path().join("b.cs")).is_empty());
        assert!(!inst.find_glob_items_including_file(&dir.path().join("a.cs")).is_empty());
    }

    #[test]
    fn condition_false_remove_only_affects_ignoring_list() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="a.cs" />
                 <Compile Remove="a.cs" Condition="'$(Never)'=='yes'" />
               </ItemGroup>"#,
        );
        assert_eq!(item_includes(inst.evaluated_items(), "Compile"), vec!["a.cs"]);
        assert!(item_includes(inst.items_ignoring_condition(), "Compile").is_empty());
    }

    #[test]
    fn condition_false_update_only_affects_ignoring_list() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="a.cs" />
                 <Compile Update="a.cs" Condition="'$(Never)'=='yes'"><Foo>1</Foo></Compile>
               </ItemGroup>"#,
        );
        assert_eq!(inst.evaluated_items()[0].metadata_value("Foo"), None);
        assert_eq!(inst.items_ignoring_condition()[0].metadata_value("Foo"), Some("1"));
    }

    #[test]
    fn items_ignoring_condition_keeps_false_items() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="a.cs" />
                 <Compile Include="b.cs" Condition="'$(Never)'=='yes'" />
               </ItemGroup>"#,
        );
        assert_eq!(item_includes(inst.evaluated_items(), "Compile"), vec!["a.cs"]);
        assert_eq!(
            item_includes(inst.items_ignoring_condition(), "Compile"),
            vec!["a.cs", "b.cs"]
        );
    }

    #[test]
    fn transform_include_creates_items() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup>
                 <Compile Include="src/a.cs"><Pack>true</Pack></Compile>
                 <Compile Include="src/b.cs" />
                 <Obj Include="@(Compile-&gt;'%(Filename).o')" />
                 <Packed Include="@(Compile-&gt;WithMetadataValue('Pack', 'true'))" />
               </ItemGroup>"#,
        );
        assert_eq!(item_includes(inst.evaluated_items(), "Obj"), vec!["a.o", "b.o"]);
        let packed: Vec<&EvaluatedItem> =
            inst.evaluated_items().iter().filter(|i| i.name == "Packed").collect();
        assert_eq!(packed.len(), 1);
        assert_eq!(packed[0].include, "src/a.cs");
        // Source metadata carries over.
        assert_eq!(packed[0].metadata_value("Pack"), Some("true"));
    }

    #[test]
    fn item_definitions_supply_default_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<ItemDefinitionGroup>
                 <Compile><Visible>false</Visible></Compile>
               </ItemDefinitionGroup>
               <ItemGroup>
                 <Compile Include="a.cs" />
                 <Compile Include="b.cs"><Visible>true</Visible></Compile>
               </ItemGroup>"#,
        );
        let items = inst.evaluated_items();
        assert_eq!(items[0].metadata_value("Visible"), Some("false"));
        assert_eq!(items[1].metadata_value("Visible"), Some("true"));
        assert_eq!(
            inst.item_definition("Compile").unwrap()["Visible"].final_value,
            "false"
        );
    }

    // ── Targets and choose ───────────────────────────────────────────────

    #[test]
    fn targets_honor_conditions() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<Target Name="Always" />
               <Target Name="Never" Condition="'$(X)'=='set'" />"#,
        );
        let names: Vec<&str> = inst.targets().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["Always"]);
        let all: Vec<&str> = inst.targets_ignoring_condition().iter().map(|t| t.name()).collect();
        assert_eq!(all, vec!["Always", "Never"]);
    }

    #[test]
    fn choose_selects_first_true_arm() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup><Mode>b</Mode></PropertyGroup>
               <Choose>
                 <When Condition="'$(Mode)'=='a'"><PropertyGroup><Got>a</Got></PropertyGroup></When>
                 <When Condition="'$(Mode)'=='b'"><PropertyGroup><Got>b</Got></PropertyGroup></When>
                 <Otherwise><PropertyGroup><Got>other</Got></PropertyGroup></Otherwise>
               </Choose>"#,
        );
        assert_eq!(inst.property_value("Got"), Some("b"));
    }

    // ── Imports ──────────────────────────────────────────────────────────

    #[test]
    fn import_contributes_items_marked_imported() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "items.targets",
            r#"<Project>
                 <ItemGroup><Extra Include="imported.txt" /></ItemGroup>
                 <Target Name="FromImport" />
               </Project>"#,
        );
        let inst = evaluated(
            dir.path(),
            r#"<ItemGroup><Extra Include="local.txt" /></ItemGroup>
               <Import Project="items.targets" />"#,
        );
        let items = inst.evaluated_items();
        assert_eq!(item_includes(items, "Extra"), vec!["local.txt", "imported.txt"]);
        assert!(!items[0].is_imported);
        assert!(items[1].is_imported);
        assert!(inst.targets()[0].is_imported);
    }

    #[test]
    fn missing_import_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let inst = evaluated(
            dir.path(),
            r#"<Import Project="nowhere.props" />
               <PropertyGroup><After>1</After></PropertyGroup>"#,
        );
        assert_eq!(inst.property_value("After"), Some("1"));
    }

    #[test]
    fn self_importing_file_is_evaluated_once() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "loop.props",
            r#"<Project>
                 <PropertyGroup><FromLoop>1</FromLoop></PropertyGroup>
                 <Import Project="loop.props" />
               </Project>"#,
        );
        let inst = evaluated(dir.path(), r#"<Import Project="loop.props" />"#);
        let prop = inst.property("FromLoop").unwrap();
        assert_eq!(prop.final_value, "1");
        assert!(!prop.defined_multiple_times);
    }

    #[test]
    fn mutually_importing_files_terminate() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "a.props",
            r#"<Project>
                 <Import Project="b.props" />
                 <PropertyGroup><FromA>1</FromA></PropertyGroup>
               </Project>"#,
        );
        write(
            dir.path(),
            "b.props",
            r#"<Project>
                 <Import Project="a.props" />
                 <PropertyGroup><FromB>1</FromB></PropertyGroup>
               </Project>"#,
        );
        let inst = evaluated(dir.path(), r#"<Import Project="a.props" />"#);
        assert_eq!(inst.property_value("FromA"), Some("1"));
        assert_eq!(inst.property_value("FromB"), Some("1"));
    }

    #[test]
    fn import_condition_with_exists() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "opt.props",
            r#"<Project><PropertyGroup><Opt>1</Opt></PropertyGroup></Project>"#,
        );
        let inst = evaluated(
            dir.path(),
            r#"<Import Project="opt.props" Condition="Exists('opt.props')" />
               <Import Project="gone.props" Condition="Exists('gone.props')" />"#,
        );
        assert_eq!(inst.property_value("Opt"), Some("1"));
    }

    #[test]
    fn wildcard_import_pulls_in_sorted_matches() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "ext/b.props",
            r#"<Project><PropertyGroup><Last>b</Last></PropertyGroup></Project>"#,
        );
        write(
            dir.path(),
            "ext/a.props",
            r#"<Project><PropertyGroup><Last>a</Last></PropertyGroup></Project>"#,
        );
        let inst = evaluated(dir.path(), r#"<Import Project="ext/*.props" />"#);
        // Sorted order makes b.props the later definition.
        assert_eq!(inst.property_value("Last"), Some("b"));
        assert!(inst.property("Last").unwrap().defined_multiple_times);
    }

    #[test]
    fn this_file_properties_inside_import() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "sub/inner.props",
            r#"<Project><PropertyGroup><Who>$(MSBuildThisFile)</Who></PropertyGroup></Project>"#,
        );
        let inst = evaluated(dir.path(), r#"<Import Project="sub/inner.props" />"#);
        assert_eq!(inst.property_value("Who"), Some("inner.props"));
    }

    #[test]
    fn imports_are_parsed_once_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "common.props",
            r#"<Project><PropertyGroup><Shared>1</Shared></PropertyGroup></Project>"#,
        );
        let p1 = write(
            dir.path(),
            "one.csproj",
            r#"<Project><Import Project="common.props" /></Project>"#,
        );
        let p2 = write(
            dir.path(),
            "two.csproj",
            r#"<Project><Import Project="common.props" /></Project>"#,
        );

        let engine = Engine::new();
        let mut a = instance(&engine, &p1);
        let mut b = instance(&engine, &p2);
        engine.evaluate(&mut a, false).unwrap();
        engine.evaluate(&mut b, false).unwrap();

        assert_eq!(a.property_value("Shared"), Some("1"));
        assert_eq!(b.property_value("Shared"), Some("1"));
        assert_eq!(engine.cache().load_count(), 1);
    }

    #[test]
    fn search_path_fallback_resolves_import() {
        let dir = tempfile::tempdir().unwrap();
        let ext_dir = dir.path().join("extensions");
        write(
            &ext_dir,
            "custom.props",
            r#"<Project><PropertyGroup><FromExt>1</FromExt></PropertyGroup></Project>"#,
        );
        let path = write(
            dir.path(),
            "app.csproj",
            r#"<Project><Import Project="$(MyExtensionsPath)/custom.props" /></Project>"#,
        );

        let mut engine = Engine::new();
        engine.add_import_search_path(ImportSearchPath::new("MyExtensionsPath", vec![ext_dir]));
        let mut inst = instance(&engine, &path);
        engine.evaluate(&mut inst, false).unwrap();
        assert_eq!(inst.property_value("FromExt"), Some("1"));
    }

    #[test]
    fn user_file_imported_last() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "app.csproj.user",
            r#"<Project><PropertyGroup><StartArgs>--verbose</StartArgs></PropertyGroup></Project>"#,
        );
        let inst = evaluated(
            dir.path(),
            r#"<PropertyGroup><StartArgs>none</StartArgs></PropertyGroup>"#,
        );
        let prop = inst.property("StartArgs").unwrap();
        assert_eq!(prop.final_value, "--verbose");
        assert!(prop.is_imported);
    }

    #[test]
    fn sdk_attribute_imports_props_and_targets() {
        let dir = tempfile::tempdir().unwrap();
        let sdk_root = dir.path().join("sdks");
        write(
            &sdk_root,
            "My.Sdk/Sdk/Sdk.props",
            r#"<Project><PropertyGroup><FromSdkProps>1</FromSdkProps></PropertyGroup></Project>"#,
        );
        write(
            &sdk_root,
            "My.Sdk/Sdk/Sdk.targets",
            r#"<Project><Target Name="SdkBuild" /></Project>"#,
        );
        let path = write(
            dir.path(),
            "app.csproj",
            r#"<Project Sdk="My.Sdk">
                 <PropertyGroup><FromSdkProps>overridden</FromSdkProps></PropertyGroup>
               </Project>"#,
        );

        let engine =
            Engine::new().with_sdk_resolver(Box::new(DirectorySdkResolver::new(&sdk_root)));
        let mut inst = instance(&engine, &path);
        engine.evaluate(&mut inst, false).unwrap();

        // Sdk.props comes first, so the project body wins.
        assert_eq!(inst.property_value("FromSdkProps"), Some("overridden"));
        assert_eq!(inst.targets()[0].name(), "SdkBuild");
        assert!(inst.targets()[0].is_imported);
    }

    #[test]
    fn sdks_path_is_scoped_to_sdk_files() {
        let dir = tempfile::tempdir().unwrap();
        let sdk_root = dir.path().join("sdks");
        write(
            &sdk_root,
            "My.Sdk/Sdk/Sdk.props",
            r#"<Project>
                 <PropertyGroup><SeenInSdk>$(MSBuildSDKsPath)</SeenInSdk></PropertyGroup>
               </Project>"#,
        );
        write(&sdk_root, "My.Sdk/Sdk/Sdk.targets", r#"<Project></Project>"#);
        let path = write(
            dir.path(),
            "app.csproj",
            r#"<Project Sdk="My.Sdk">
                 <PropertyGroup><SeenInBody>$(MSBuildSDKsPath)</SeenInBody></PropertyGroup>
               </Project>"#,
        );

        let engine =
            Engine::new().with_sdk_resolver(Box::new(DirectorySdkResolver::new(&sdk_root)));
        let mut inst = instance(&engine, &path);
        engine.evaluate(&mut inst, false).unwrap();

        // The SDK file sees its own root; the project body does not.
        let expected = sdk_root.to_string_lossy().replace('\\', "/");
        assert_eq!(inst.property_value("SeenInSdk"), Some(expected.as_str()));
        assert_eq!(inst.property_value("SeenInBody"), Some(""));
    }

    // ── Re-evaluation ────────────────────────────────────────────────────

    #[test]
    fn evaluation_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        write(
            dir.path(),
            "common.props",
            r#"<Project><PropertyGroup><Shared>1</Shared></PropertyGroup></Project>"#,
        );
        let path = write(
            dir.path(),
            "app.csproj",
            r#"<Project>
                 <Import Project="common.props" />
                 <ItemGroup><Compile Include="*.cs" /></ItemGroup>
               </Project>"#,
        );
        let engine = Engine::new();
        let mut inst = instance(&engine, &path);

        engine.evaluate(&mut inst, false).unwrap();
        let first_items = item_includes(inst.evaluated_items(), "Compile");
        engine.evaluate(&mut inst, false).unwrap();

        assert_eq!(item_includes(inst.evaluated_items(), "Compile"), first_items);
        assert_eq!(inst.property_value("Shared"), Some("1"));
        // The import stayed cached across the two evaluations.
        assert_eq!(engine.cache().load_count(), 1);
    }

    #[test]
    fn only_properties_skips_items() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.cs", "");
        let path = write(
            dir.path(),
            "app.csproj",
            r#"<Project>
                 <PropertyGroup><P>1</P></PropertyGroup>
                 <ItemGroup><Compile Include="*.cs" /></ItemGroup>
                 <Target Name="Build" />
               </Project>"#,
        );
        let engine = Engine::new();
        let mut inst = instance(&engine, &path);
        engine.evaluate(&mut inst, true).unwrap();

        assert_eq!(inst.property_value("P"), Some("1"));
        assert!(inst.evaluated_items().is_empty());
        assert!(inst.targets().is_empty());
    }
}
