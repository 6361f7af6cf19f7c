//! In-scope namespace bindings for the extractor

/// Stack of `xmlns` bindings, one scope per open element.
#[derive(Debug, Default)]
pub struct NamespaceStack {
    /// (prefix, uri); the default namespace has an empty prefix
    bindings: Vec<(String, String)>,
    /// Start index into `bindings` for each open element
    marks: Vec<usize>,
}

impl NamespaceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an element scope with the declarations found on its start tag.
    pub fn push_scope(&mut self, decls: impl IntoIterator<Item = (String, String)>) {
        self.marks.push(self.bindings.len());
        self.bindings.extend(decls);
    }

    pub fn pop_scope(&mut self) {
        if let Some(mark) = self.marks.pop() {
            self.bindings.truncate(mark);
        }
    }

    /// Namespace URI bound to `prefix` (`""` for the default namespace).
    ///
    /// An empty binding (`xmlns=""`) undeclares the namespace.
    pub fn resolve(&self, prefix: &str) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p == prefix)
            .map(|(_, uri)| uri.as_str())
            .filter(|uri| !uri.is_empty())
    }

    /// Bindings visible at the current depth, innermost first, one per prefix.
    pub fn in_scope(&self) -> Vec<(&str, &str)> {
        let mut seen: Vec<(&str, &str)> = Vec::new();
        for (prefix, uri) in self.bindings.iter().rev() {
            if !seen.iter().any(|(p, _)| p == prefix) {
                seen.push((prefix, uri));
            }
        }
        seen
    }

    pub fn depth(&self) -> usize {
        self.marks.len()
    }
}

/// Split a qualified name into (prefix, local).
pub fn split_qname(qname: &str) -> (&str, &str) {
    match qname.split_once(':') {
        Some((prefix, local)) => (prefix, local),
        None => ("", qname),
    }
}

/// Prefix declared by an attribute key, if it is a namespace declaration.
pub fn declared_prefix(key: &str) -> Option<&str> {
    if key == "xmlns" {
        Some("")
    } else {
        key.strip_prefix("xmlns:")
    }
}
