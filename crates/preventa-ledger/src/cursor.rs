//! Paged, restartable reads of "what changed since watermark W".

use preventa_core::{EntityKind, SyncableRecord, TenantId, Watermark};

use crate::error::Result;
use crate::traits::Ledger;

/// A lazy, finite, restartable sequence of changed records.
///
/// Pages are fetched on demand in `change_seq` order. The sequence is bounded
/// above by the `upto` watermark fixed at creation, so it terminates even
/// while other sessions keep writing. [`ChangeCursor::position`] is the last
/// stamp handed out; a new cursor resumed from it continues without gaps or
/// repeats.
pub struct ChangeCursor<'a, L: Ledger + ?Sized> {
    ledger: &'a L,
    tenant: TenantId,
    kind: EntityKind,
    position: Watermark,
    upto: Watermark,
    include_deleted: bool,
    page_size: usize,
    exhausted: bool,
}

impl<'a, L: Ledger + ?Sized> ChangeCursor<'a, L> {
    pub fn new(
        ledger: &'a L,
        tenant: TenantId,
        kind: EntityKind,
        since: Option<Watermark>,
        upto: Watermark,
        page_size: usize,
    ) -> Self {
        let position = since.unwrap_or(Watermark::ZERO);
        Self {
            ledger,
            tenant,
            kind,
            position,
            upto,
            include_deleted: since.is_some(),
            page_size: page_size.max(1),
            exhausted: position >= upto,
        }
    }

    /// Continue from a previously observed position instead of the start.
    pub fn resume_from(mut self, position: Watermark) -> Self {
        self.position = position.max(self.position);
        self.exhausted = self.position >= self.upto;
        self
    }

    /// Last `change_seq` handed out (or the starting watermark).
    pub fn position(&self) -> Watermark {
        self.position
    }

    /// Upper bound of this cursor.
    pub fn upto(&self) -> Watermark {
        self.upto
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Fetch the next page. Returns `None` once the cursor is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<SyncableRecord>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .ledger
            .records_since_page(
                &self.tenant,
                self.kind,
                self.position,
                self.upto,
                self.include_deleted,
                self.page_size,
            )
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        match page.last() {
            Some(last) => self.position = last.change_seq,
            None => {
                self.exhausted = true;
                return Ok(None);
            }
        }
        if self.position >= self.upto {
            self.exhausted = true;
        }

        Ok(Some(page))
    }

    /// Drain the cursor into a single vector.
    pub async fn collect_all(mut self) -> Result<Vec<SyncableRecord>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }
}
