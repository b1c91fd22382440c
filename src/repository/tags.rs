use super::{Repository, Revnum};
use crate::git::fast_import;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedTag {
    /// Ref whose tip the tag points at.
    pub supporting_ref: String,
    pub svn_prefix: String,
    pub revision: Revnum,
    pub author: String,
    pub epoch: i64,
    pub message: String,
}

/// Tag name as shown to users: the ref without `refs/tags/`.
pub fn tag_name(ref_name: &str) -> &str {
    ref_name.strip_prefix("refs/tags/").unwrap_or(ref_name)
}

impl Repository {
    /// Queue an annotated tag on `ref_name`. Declaring the same tag again
    /// before it is written replaces it.
    pub fn create_annotated_tag(
        &mut self,
        ref_name: &str,
        svn_prefix: &str,
        revision: Revnum,
        author: &str,
        epoch: i64,
        message: &str,
    ) {
        let name = tag_name(ref_name).to_string();
        if self.annotated_tags.contains_key(&name) {
            tracing::debug!(repo = %self.name, "re-creating annotated tag {name}");
        } else {
            tracing::debug!(repo = %self.name, "creating annotated tag {name} ({ref_name})");
        }
        self.annotated_tags.insert(
            name,
            AnnotatedTag {
                supporting_ref: ref_name.to_string(),
                svn_prefix: svn_prefix.to_string(),
                revision,
                author: author.to_string(),
                epoch,
                message: message.to_string(),
            },
        );
    }

    pub fn has_pending_tags(&self) -> bool {
        !self.annotated_tags.is_empty()
    }

    /// Write every queued tag. Runs once all commits of the revision are
    /// written so each tag sees the final tip of its ref.
    pub fn finalize_tags(&mut self) -> Result<()> {
        if self.annotated_tags.is_empty() {
            return Ok(());
        }
        let tags = std::mem::take(&mut self.annotated_tags);
        tracing::debug!(repo = %self.name, "finalising {} tags", tags.len());

        for (name, tag) in tags {
            let mut message = tag.message.clone();
            if !message.ends_with('\n') {
                message.push('\n');
            }
            if self.options.add_metadata {
                message.push('\n');
                let trailer = fast_import::metadata_message(&tag.svn_prefix, tag.revision, &name);
                message.push_str(&trailer);
            }

            let mut out = Vec::new();
            fast_import::progress(
                &mut out,
                &format!("Creating annotated tag {name} from ref {}", tag.supporting_ref),
            )?;
            fast_import::tag(
                &mut out,
                &name,
                &tag.supporting_ref,
                &tag.author,
                tag.epoch,
                &message,
            )?;
            self.process.write(&out)?;

            // fast-import cannot attach a note to the tag itself
            if self.options.add_metadata_notes {
                let text = fast_import::metadata_message(&tag.svn_prefix, tag.revision, &name);
                self.commit_note(&tag.supporting_ref, &text, true, &tag.author, tag.epoch)?;
            }
        }
        self.process.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_name() {
        assert_eq!(tag_name("refs/tags/v1.0"), "v1.0");
        assert_eq!(tag_name("refs/heads/v1.0"), "refs/heads/v1.0");
    }
}
