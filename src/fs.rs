// Open-file and inode handles
//
// The process core only duplicates and releases these references; the file
// system itself lives elsewhere. A handle is a counted reference: `dup` adds
// one, `close`/`put` (or drop) removes one.
use alloc::string::String;
use alloc::sync::Arc;

#[derive(Debug)]
struct OpenFile {
    name: String,
}

/// Reference to an open file description.
#[derive(Debug, Clone)]
pub struct File(Arc<OpenFile>);

impl File {
    pub fn open(name: &str) -> Self {
        File(Arc::new(OpenFile {
            name: String::from(name),
        }))
    }

    /// Another reference to the same open file (`filedup`).
    pub fn dup(&self) -> Self {
        self.clone()
    }

    pub fn close(self) {}

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Number of references to this open file.
    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[derive(Debug)]
struct InodeData {
    path: String,
}

/// Reference to an in-memory inode, e.g. a working directory.
#[derive(Debug, Clone)]
pub struct Inode(Arc<InodeData>);

impl Inode {
    pub fn lookup(path: &str) -> Self {
        Inode(Arc::new(InodeData {
            path: String::from(path),
        }))
    }

    pub fn dup(&self) -> Self {
        self.clone()
    }

    pub fn put(self) {}

    pub fn path(&self) -> &str {
        &self.0.path
    }

    pub fn refs(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dup_and_close_track_references() {
        let console = File::open("console");
        let a = console.dup();
        let b = a.dup();
        assert_eq!(console.refs(), 3);
        a.close();
        b.close();
        assert_eq!(console.refs(), 1);
        assert_eq!(console.name(), "console");
    }
}
