use std::collections::HashMap;

/// Deduplicating string table owned by a [`Sequence`].
///
/// Id 0 is reserved for the empty string so that a zero operand lane can
/// always be read as "no text".
///
/// [`Sequence`]: crate::Sequence
#[derive(Debug, Clone, Default)]
pub struct StringRefs {
    strings: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringRefs {
    pub fn new() -> Self {
        let mut refs = Self {
            strings: Vec::new(),
            index: HashMap::new(),
        };
        refs.strings.push(String::new());
        refs.index.insert(String::new(), 0);
        refs
    }

    /// Intern `text`, returning its stable id.
    pub fn intern(&mut self, text: &str) -> u32 {
        if let Some(&id) = self.index.get(text) {
            return id;
        }
        let id = self.strings.len() as u32;
        self.strings.push(text.to_owned());
        self.index.insert(text.to_owned(), id);
        id
    }

    /// Resolve an id back to text. Unknown ids resolve to the empty string.
    pub fn get(&self, id: u32) -> &str {
        self.strings.get(id as usize).map_or("", String::as_str)
    }

    /// Look up without interning.
    pub fn find(&self, text: &str) -> Option<u32> {
        self.index.get(text).copied()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        // the reserved empty string always exists
        self.strings.len() <= 1
    }
}
