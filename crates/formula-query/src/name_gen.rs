/// Generates `prefix1`, `prefix2`, ... identifiers.
#[derive(Debug, Clone)]
pub struct PrefixedIdGen {
    prefix: String,
    next: usize,
}

impl PrefixedIdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        PrefixedIdGen {
            prefix: prefix.into(),
            next: 1,
        }
    }

    pub fn get_id(&mut self) -> String {
        let id = format!("{}{}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ids_are_sequential() {
        let mut gen = PrefixedIdGen::new("q");
        assert_eq!(gen.get_id(), "q1");
        assert_eq!(gen.get_id(), "q2");
    }
}
