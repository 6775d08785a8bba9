//! A line-oriented reference VM.
//!
//! Every unit is a list of directives, one per line, each ends with `;`.
//! Lines starting with `//` are comments.
//!
//! ```text
//! library app;
//! import "util.dart";
//! import "dart:core";
//! deferred import "plugin.dart";
//! part "app_part.dart";
//! print "hello";
//! main;
//! ```
//!
//! Imports and parts are raised through the library-tag handler while the
//! unit is loaded, deferred imports are raised while the entry point runs.

use crate::isolate::{IsolateId, IsolateKind};
use crate::prelude::*;
use crate::vm::{
  DependencyKind, IsolateFactory, Library, LibraryHandle, LibraryTagHandler,
  TagResponse, VmEmbedding, VmEmbeddingRc, VmError, VmResult,
};

use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::rc::Rc;

/// Built-in system libraries.
pub static BUILTIN_LIBRARIES: &[&str] = &[
  "dart:core",
  "dart:async",
  "dart:collection",
  "dart:isolate",
  "dart:math",
  "dart:html",
];

/// Name of the only entry point a unit can declare.
pub const MAIN_ENTRY: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq)]
/// A parsed directive.
pub enum Directive {
  Library(String),
  Import(String),
  DeferredImport(String),
  Part(String),
  Print(String),
  Main,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A library in the VM's library table.
pub struct LibraryRecord {
  pub url: String,
  pub name: Option<String>,
  pub is_script: bool,
  // Canonical urls.
  pub imports: Vec<String>,
  pub deferred: Vec<String>,
  pub parts: Vec<String>,
  pub loaded_parts: Vec<String>,
  pub prints: Vec<String>,
  pub has_main: bool,
}

impl LibraryRecord {
  fn new(url: &str, is_script: bool) -> Self {
    LibraryRecord {
      url: url.to_string(),
      name: None,
      is_script,
      imports: vec![],
      deferred: vec![],
      parts: vec![],
      loaded_parts: vec![],
      prints: vec![],
      has_main: false,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
// Snapshot image, i.e. the resolved library table.
struct SnapshotImage {
  script: Option<usize>,
  libraries: Vec<LibraryRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Calls received by the VM, in order.
pub enum VmCall {
  InstallHandler,
  LoadScript(String),
  LoadLibrary(String),
  LoadSource { importer: String, url: String },
  Finalize(bool),
  InvokeEntryPoint,
  CreateSnapshot,
  LoadFromSnapshot,
  Shutdown,
}

pub fn is_builtin_library(url: &str) -> bool {
  BUILTIN_LIBRARIES.contains(&url)
}

fn quoted(url: &str, line: u32, body: &str) -> VmResult<String> {
  let body = body.trim();
  if body.len() >= 2 && body.starts_with('"') && body.ends_with('"') {
    Ok(body[1..body.len() - 1].to_string())
  } else {
    Err(VmError::compile(
      url,
      Some(line),
      format!("Expected a quoted string, found `{body}`"),
    ))
  }
}

/// Parses a unit into directives with their line numbers, `line_offset` is
/// added to every line number.
pub fn parse_unit(
  url: &str,
  text: &str,
  line_offset: u32,
) -> VmResult<Vec<(u32, Directive)>> {
  let mut directives = vec![];
  for (index, raw) in text.lines().enumerate() {
    let line = line_offset + index as u32 + 1;
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with("//") {
      continue;
    }
    let body = match trimmed.strip_suffix(';') {
      Some(body) => body.trim(),
      None => {
        return Err(VmError::compile(url, Some(line), "Expected `;`"));
      }
    };

    let directive = if body == MAIN_ENTRY {
      Directive::Main
    } else if let Some(rest) = body.strip_prefix("library ") {
      let name = rest.trim();
      let valid = name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
      if name.is_empty() || !valid {
        return Err(VmError::compile(
          url,
          Some(line),
          format!("Invalid library name `{name}`"),
        ));
      }
      Directive::Library(name.to_string())
    } else if let Some(rest) = body.strip_prefix("deferred import ") {
      Directive::DeferredImport(quoted(url, line, rest)?)
    } else if let Some(rest) = body.strip_prefix("import ") {
      Directive::Import(quoted(url, line, rest)?)
    } else if let Some(rest) = body.strip_prefix("part ") {
      Directive::Part(quoted(url, line, rest)?)
    } else if let Some(rest) = body.strip_prefix("print ") {
      Directive::Print(quoted(url, line, rest)?)
    } else {
      return Err(VmError::compile(
        url,
        Some(line),
        format!("Unknown directive `{body}`"),
      ));
    };
    directives.push((line, directive));
  }
  Ok(directives)
}

fn canonicalize(
  handler: &mut dyn LibraryTagHandler,
  importer: &Library,
  url: &str,
  line: u32,
) -> VmResult<String> {
  let response = handler.handle_library_tag(
    DependencyKind::CanonicalizeUrl,
    importer,
    url,
  )?;
  match response {
    TagResponse::Canonical(canonical) => Ok(canonical),
    TagResponse::Acknowledged => Err(VmError::compile(
      &importer.url,
      Some(line),
      format!("Cannot canonicalize `{url}`"),
    )),
  }
}

#[derive(Debug)]
/// Line-oriented reference VM of a single isolate.
pub struct TextVm {
  entry_name: String,
  libraries: Vec<LibraryRecord>,
  script: Option<usize>,
  // Deferred imports raised so far.
  raised_deferred: Vec<String>,
  hook_installed: bool,
  finalized: bool,
  entry_invoked: bool,
  shut_down: bool,

  // Program output.
  output: Vec<String>,
  // Also print the output to stdout.
  echo: bool,

  journal: Vec<VmCall>,
}

rc_refcell_ptr!(TextVm);

impl TextVm {
  pub fn new(entry_name: &str, echo: bool) -> Self {
    TextVm {
      entry_name: entry_name.to_string(),
      libraries: vec![],
      script: None,
      raised_deferred: vec![],
      hook_installed: false,
      finalized: false,
      entry_invoked: false,
      shut_down: false,
      output: vec![],
      echo,
      journal: vec![],
    }
  }

  pub fn output(&self) -> &Vec<String> {
    &self.output
  }

  pub fn journal(&self) -> &Vec<VmCall> {
    &self.journal
  }

  pub fn libraries(&self) -> &Vec<LibraryRecord> {
    &self.libraries
  }

  pub fn library(&self, url: &str) -> Option<&LibraryRecord> {
    self.libraries.iter().find(|lib| lib.url == url)
  }

  pub fn is_loaded(&self, url: &str) -> bool {
    self.library(url).is_some()
  }

  pub fn entry_invoked(&self) -> bool {
    self.entry_invoked
  }

  pub fn is_shut_down(&self) -> bool {
    self.shut_down
  }

  fn check_alive(&self) -> VmResult<()> {
    if self.shut_down {
      Err(VmError::new("Isolate is shut down"))
    } else {
      Ok(())
    }
  }

  fn emit(&mut self, text: String) {
    if self.echo {
      println!("{text}");
    }
    self.output.push(text);
  }

  fn load_unit(
    &mut self,
    url: &str,
    text: &str,
    line_offset: u32,
    is_script: bool,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<LibraryHandle> {
    self.check_alive()?;
    if self.is_loaded(url) {
      return Err(VmError::compile(url, None, "Library is already loaded"));
    }
    if is_script && self.script.is_some() {
      return Err(VmError::compile(url, None, "Script is already loaded"));
    }
    let directives = parse_unit(url, text, line_offset)?;

    let index = self.libraries.len();
    let handle = LibraryHandle::new(index);
    let library = Library::new(handle, url);
    let mut record = LibraryRecord::new(url, is_script);

    // The record is only added once every directive is accepted.
    for (line, directive) in directives {
      match directive {
        Directive::Library(name) => {
          if record.name.is_some() {
            return Err(VmError::compile(
              url,
              Some(line),
              "Duplicated library name",
            ));
          }
          record.name = Some(name);
        }
        Directive::Import(target) => {
          let canonical = canonicalize(handler, &library, &target, line)?;
          if canonical.starts_with(crate::vm::SYSTEM_SCHEME) {
            if !is_builtin_library(&canonical) {
              return Err(VmError::compile(
                url,
                Some(line),
                format!("Unknown system library `{canonical}`"),
              ));
            }
          } else if !self.is_loaded(&canonical) && canonical != url {
            handler.handle_library_tag(
              DependencyKind::Import,
              &library,
              &canonical,
            )?;
          }
          record.imports.push(canonical);
        }
        Directive::DeferredImport(target) => {
          let canonical = canonicalize(handler, &library, &target, line)?;
          record.deferred.push(canonical);
        }
        Directive::Part(target) => {
          let canonical = canonicalize(handler, &library, &target, line)?;
          handler.handle_library_tag(
            DependencyKind::SourceInclude,
            &library,
            &canonical,
          )?;
          record.parts.push(canonical);
        }
        Directive::Print(message) => record.prints.push(message),
        Directive::Main => record.has_main = true,
      }
    }

    trace!("|TextVm::load_unit| url:{url:?} handle:{handle} script:{is_script}");
    self.libraries.push(record);
    if is_script {
      self.script = Some(index);
    }
    Ok(handle)
  }

  fn unresolved(&self, complete_deferred: bool) -> Option<VmError> {
    for lib in self.libraries.iter() {
      for import in lib.imports.iter() {
        if !is_builtin_library(import) && !self.is_loaded(import) {
          return Some(VmError::compile(
            &lib.url,
            None,
            format!("Unresolved import `{import}`"),
          ));
        }
      }
      for part in lib.parts.iter() {
        if !lib.loaded_parts.contains(part) {
          return Some(VmError::compile(
            &lib.url,
            None,
            format!("Missing part `{part}`"),
          ));
        }
      }
    }
    if complete_deferred {
      for deferred in self.raised_deferred.iter() {
        if !self.is_loaded(deferred) {
          return Some(VmError::new(format!(
            "Deferred library `{deferred}` failed to load"
          )));
        }
      }
    }
    None
  }
}

impl VmEmbedding for TextVm {
  fn install_library_tag_handler(&mut self) -> VmResult<()> {
    self.check_alive()?;
    self.journal.push(VmCall::InstallHandler);
    if self.hook_installed {
      return Err(VmError::new("Library tag handler is already installed"));
    }
    self.hook_installed = true;
    Ok(())
  }

  fn load_script(
    &mut self,
    url: &str,
    text: &str,
    line_offset: u32,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<LibraryHandle> {
    self.journal.push(VmCall::LoadScript(url.to_string()));
    self.load_unit(url, text, line_offset, true, handler)
  }

  fn load_library(
    &mut self,
    url: &str,
    text: &str,
    line_offset: u32,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<LibraryHandle> {
    self.journal.push(VmCall::LoadLibrary(url.to_string()));
    self.load_unit(url, text, line_offset, false, handler)
  }

  fn load_source(
    &mut self,
    importer: LibraryHandle,
    url: &str,
    text: &str,
    line_offset: u32,
    _handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<()> {
    self.check_alive()?;
    let importer_url = match self.libraries.get(importer.value()) {
      Some(lib) => lib.url.clone(),
      None => {
        return Err(VmError::new(format!("Unknown library handle {importer}")));
      }
    };
    self.journal.push(VmCall::LoadSource {
      importer: importer_url,
      url: url.to_string(),
    });

    let mut prints = vec![];
    let mut has_main = false;
    for (line, directive) in parse_unit(url, text, line_offset)? {
      match directive {
        Directive::Print(message) => prints.push(message),
        Directive::Main => has_main = true,
        _ => {
          return Err(VmError::compile(
            url,
            Some(line),
            "Only `print` and `main` are allowed in a part",
          ));
        }
      }
    }

    let record = &mut self.libraries[importer.value()];
    record.prints.extend(prints);
    record.has_main |= has_main;
    record.loaded_parts.push(url.to_string());
    Ok(())
  }

  fn finalize_compilation(&mut self, complete_deferred: bool) -> VmResult<()> {
    self.check_alive()?;
    self.journal.push(VmCall::Finalize(complete_deferred));
    if let Some(e) = self.unresolved(complete_deferred) {
      return Err(e);
    }
    self.finalized = true;
    Ok(())
  }

  fn invoke_entry_point(
    &mut self,
    handler: &mut dyn LibraryTagHandler,
  ) -> VmResult<()> {
    self.check_alive()?;
    self.journal.push(VmCall::InvokeEntryPoint);
    if !self.finalized {
      return Err(VmError::new("Compilation is not finalized"));
    }
    if self.entry_invoked {
      return Err(VmError::new("Entry point is already invoked"));
    }
    let index = match self.script {
      Some(index) => index,
      None => return Err(VmError::new("No script is loaded")),
    };
    let script = self.libraries[index].clone();
    if self.entry_name != MAIN_ENTRY || !script.has_main {
      return Err(
        VmError::compile(
          &script.url,
          None,
          format!("Entry point `{}` not found", self.entry_name),
        )
        .with_exception("NoSuchMethodError"),
      );
    }

    self.entry_invoked = true;
    for message in script.prints.iter() {
      self.emit(message.clone());
    }

    let library = Library::new(LibraryHandle::new(index), &script.url);
    for deferred in script.deferred.iter() {
      if is_builtin_library(deferred)
        || self.is_loaded(deferred)
        || self.raised_deferred.contains(deferred)
      {
        continue;
      }
      self.raised_deferred.push(deferred.clone());
      handler.handle_library_tag(DependencyKind::Import, &library, deferred)?;
    }
    Ok(())
  }

  fn create_snapshot(&mut self) -> VmResult<Vec<u8>> {
    self.check_alive()?;
    self.journal.push(VmCall::CreateSnapshot);
    if !self.finalized {
      return Err(VmError::new("Cannot snapshot an unfinalized program"));
    }
    let image = SnapshotImage {
      script: self.script,
      libraries: self.libraries.clone(),
    };
    postcard::to_allocvec(&image)
      .map_err(|e| VmError::new(format!("Failed to encode snapshot: {e}")))
  }

  fn load_from_snapshot(&mut self, snapshot: &[u8]) -> VmResult<()> {
    self.check_alive()?;
    self.journal.push(VmCall::LoadFromSnapshot);
    if !self.libraries.is_empty() {
      return Err(VmError::new("Snapshot must be loaded into an empty isolate"));
    }
    let image: SnapshotImage = postcard::from_bytes(snapshot)
      .map_err(|e| VmError::new(format!("Failed to decode snapshot: {e}")))?;
    if image.script.is_some_and(|script| script >= image.libraries.len()) {
      return Err(VmError::new("Snapshot script index is out of range"));
    }
    self.script = image.script;
    self.libraries = image.libraries;
    Ok(())
  }

  fn shutdown(&mut self) {
    if !self.shut_down {
      self.journal.push(VmCall::Shutdown);
      self.shut_down = true;
    }
  }
}

#[derive(Debug, Default)]
/// Creates [`TextVm`] isolates.
pub struct TextVmFactory {
  echo: bool,
  flags: Vec<String>,
  vm_initialized: bool,
  // Fails isolate creation once this many isolates exist.
  isolate_limit: Option<usize>,
  created: Rc<RefCell<Vec<(IsolateId, IsolateKind, TextVmRc)>>>,
}

impl TextVmFactory {
  pub fn new(echo: bool) -> Self {
    TextVmFactory {
      echo,
      ..Default::default()
    }
  }

  pub fn with_isolate_limit(mut self, limit: usize) -> Self {
    self.isolate_limit = Some(limit);
    self
  }

  pub fn flags(&self) -> &Vec<String> {
    &self.flags
  }

  /// Shared list of every isolate created so far.
  pub fn created(&self) -> Rc<RefCell<Vec<(IsolateId, IsolateKind, TextVmRc)>>> {
    self.created.clone()
  }
}

impl IsolateFactory for TextVmFactory {
  fn initialize_vm(&mut self, flags: &[String]) -> AnyResult<()> {
    if self.vm_initialized {
      anyhow::bail!("VM is already initialized");
    }
    self.flags = flags.to_vec();
    self.vm_initialized = true;
    Ok(())
  }

  fn create_isolate(
    &mut self,
    id: IsolateId,
    kind: IsolateKind,
    url: &str,
    entry_name: &str,
  ) -> Result<VmEmbeddingRc, String> {
    if !self.vm_initialized {
      return Err("VM is not initialized".to_string());
    }
    if url.is_empty() {
      return Err("Isolate url is empty".to_string());
    }
    if let Some(limit) = self.isolate_limit {
      if self.created.borrow().len() >= limit {
        return Err(format!("Isolate limit {limit} is reached"));
      }
    }

    trace!("|TextVmFactory::create_isolate| isolate:{id} kind:{kind} url:{url:?}");
    let vm = TextVm::to_rc(TextVm::new(entry_name, self.echo));
    self.created.borrow_mut().push((id, kind, vm.clone()));
    Ok(vm)
  }
}
