use crate::error::ContractError;

/// Raw per-row length arrays as supplied by the caller.
///
/// Offsets index the row dimension of the flattened (`total x heads x dim`)
/// storage. Used-length overrides shorten a row without moving it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceSpec<'a> {
    pub batch_size: usize,
    /// Static length, or the maximum length in ragged mode.
    pub seqlen_q: usize,
    pub seqlen_k: usize,
    /// Rows available in the query / key storage.
    pub total_q: usize,
    pub total_k: usize,
    pub cu_seqlens_q: Option<&'a [i32]>,
    pub cu_seqlens_k: Option<&'a [i32]>,
    pub seqused_q: Option<&'a [i32]>,
    /// End of the valid keys of each row, left padding included.
    pub seqused_k: Option<&'a [i32]>,
    pub leftpad_k: Option<&'a [i32]>,
    /// Keys appended to every row before attention.
    pub seqlen_k_new: usize,
}

/// Resolved extent of one batch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSequence {
    pub q_offset: usize,
    pub q_len: usize,
    pub k_offset: usize,
    /// Keys attended to, appended keys included.
    pub k_len: usize,
    /// Keys present before the append stage.
    pub k_len_og: usize,
    pub leftpad_k: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceTable {
    rows: Vec<BatchSequence>,
    varlen_q: bool,
    varlen_k: bool,
    has_seqused_q: bool,
    has_seqused_k: bool,
    has_leftpad_k: bool,
}

fn checked_lengths(
    name: &'static str,
    values: &[i32],
    expected: usize,
) -> Result<Vec<usize>, ContractError> {
    if values.len() != expected {
        return Err(ContractError::OffsetsLength {
            name,
            expected,
            actual: values.len(),
        });
    }
    values
        .iter()
        .map(|&value| {
            usize::try_from(value).map_err(|_| {
                ContractError::Invalid(format!(
                    "{name} contains negative value {value}"
                ))
            })
        })
        .collect()
}

fn checked_offsets(
    name: &'static str,
    values: &[i32],
    batch_size: usize,
    total: usize,
) -> Result<Vec<usize>, ContractError> {
    let offsets = checked_lengths(name, values, batch_size + 1)?;
    if let Some(index) = offsets.windows(2).position(|pair| pair[1] < pair[0])
    {
        return Err(ContractError::OffsetsDecreasing {
            name,
            index: index + 1,
        });
    }
    let last = offsets.last().copied().unwrap_or(0);
    if last > total {
        return Err(ContractError::OffsetsOverflow {
            name,
            last,
            total,
        });
    }
    Ok(offsets)
}

impl SequenceTable {
    pub fn resolve(spec: &SequenceSpec<'_>) -> Result<Self, ContractError> {
        let batch_size = spec.batch_size;
        let cu_q = spec
            .cu_seqlens_q
            .map(|values| {
                checked_offsets("cu_seqlens_q", values, batch_size, spec.total_q)
            })
            .transpose()?;
        let cu_k = spec
            .cu_seqlens_k
            .map(|values| {
                checked_offsets("cu_seqlens_k", values, batch_size, spec.total_k)
            })
            .transpose()?;
        let used_q = spec
            .seqused_q
            .map(|values| checked_lengths("seqused_q", values, batch_size))
            .transpose()?;
        let used_k = spec
            .seqused_k
            .map(|values| checked_lengths("seqused_k", values, batch_size))
            .transpose()?;
        let leftpad = spec
            .leftpad_k
            .map(|values| checked_lengths("leftpad_k", values, batch_size))
            .transpose()?;

        let mut rows = Vec::with_capacity(batch_size);
        for batch in 0..batch_size {
            let (q_offset, q_capacity) = match &cu_q {
                Some(offsets) => {
                    (offsets[batch], offsets[batch + 1] - offsets[batch])
                },
                None => (0, spec.seqlen_q),
            };
            let q_len = match &used_q {
                Some(used) => {
                    if used[batch] > q_capacity {
                        return Err(ContractError::UsedLengthOverflow {
                            name: "seqused_q",
                            index: batch,
                            used: used[batch],
                            length: q_capacity,
                        });
                    }
                    used[batch]
                },
                None => q_capacity,
            };

            let leftpad_k = leftpad.as_ref().map_or(0, |values| values[batch]);
            let (k_start, k_capacity) = match &cu_k {
                Some(offsets) => {
                    (offsets[batch], offsets[batch + 1] - offsets[batch])
                },
                None => (0, spec.seqlen_k),
            };
            if leftpad_k > k_capacity {
                return Err(ContractError::UsedLengthOverflow {
                    name: "leftpad_k",
                    index: batch,
                    used: leftpad_k,
                    length: k_capacity,
                });
            }
            let k_available = k_capacity - leftpad_k;
            let k_len_og = match &used_k {
                Some(used) => used[batch].checked_sub(leftpad_k).ok_or(
                    ContractError::UsedLengthOverflow {
                        name: "leftpad_k",
                        index: batch,
                        used: leftpad_k,
                        length: used[batch],
                    },
                )?,
                None if spec.seqlen_k_new > 0 => 0,
                None => k_available,
            };
            let k_len = k_len_og + spec.seqlen_k_new;
            if k_len > k_available {
                return Err(ContractError::UsedLengthOverflow {
                    name: "seqused_k",
                    index: batch,
                    used: k_len,
                    length: k_available,
                });
            }

            rows.push(BatchSequence {
                q_offset,
                q_len,
                k_offset: k_start + leftpad_k,
                k_len,
                k_len_og,
                leftpad_k,
            });
        }

        Ok(Self {
            rows,
            varlen_q: cu_q.is_some(),
            varlen_k: cu_k.is_some(),
            has_seqused_q: used_q.is_some(),
            has_seqused_k: used_k.is_some(),
            has_leftpad_k: leftpad.is_some(),
        })
    }

    pub fn rows(&self) -> &[BatchSequence] {
        &self.rows
    }

    pub fn row(
        &self,
        batch: usize,
    ) -> &BatchSequence {
        &self.rows[batch]
    }

    pub fn batch_size(&self) -> usize {
        self.rows.len()
    }

    pub fn is_varlen_q(&self) -> bool {
        self.varlen_q
    }

    pub fn is_varlen_k(&self) -> bool {
        self.varlen_k
    }

    pub fn has_seqused_k(&self) -> bool {
        self.has_seqused_k
    }

    pub fn has_leftpad_k(&self) -> bool {
        self.has_leftpad_k
    }

    /// Any per-row length information beyond the static shapes.
    pub fn is_varlen(&self) -> bool {
        self.varlen_q
            || self.varlen_k
            || self.has_seqused_q
            || self.has_seqused_k
            || self.has_leftpad_k
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ragged_rows() {
        let cu_q = [0, 1, 6, 9];
        let table = SequenceTable::resolve(&SequenceSpec {
            batch_size: 3,
            seqlen_q: 5,
            seqlen_k: 5,
            total_q: 9,
            total_k: 9,
            cu_seqlens_q: Some(&cu_q),
            cu_seqlens_k: Some(&cu_q),
            ..Default::default()
        })
        .unwrap();
        assert!(table.is_varlen());
        let lengths: Vec<usize> =
            table.rows().iter().map(|row| row.q_len).collect();
        assert_eq!(lengths, vec![1, 5, 3]);
        assert_eq!(table.row(2).k_offset, 6);
    }

    #[test]
    fn test_decreasing_offsets() {
        let cu_q = [0, 4, 3];
        let error = SequenceTable::resolve(&SequenceSpec {
            batch_size: 2,
            total_q: 4,
            cu_seqlens_q: Some(&cu_q),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(
            error,
            ContractError::OffsetsDecreasing {
                name: "cu_seqlens_q",
                index: 2,
            }
        );
    }

    #[test]
    fn test_offsets_length() {
        let cu_q = [0, 4];
        let error = SequenceTable::resolve(&SequenceSpec {
            batch_size: 2,
            total_q: 4,
            cu_seqlens_q: Some(&cu_q),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(error, ContractError::OffsetsLength { .. }));
    }

    #[test]
    fn test_used_length_overflow() {
        let cu_q = [0, 2, 4];
        let used = [2, 3];
        let error = SequenceTable::resolve(&SequenceSpec {
            batch_size: 2,
            total_q: 4,
            cu_seqlens_q: Some(&cu_q),
            seqused_q: Some(&used),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(error, ContractError::UsedLengthOverflow { .. }));
    }

    #[test]
    fn test_cache_rows_with_append_and_leftpad() {
        let seqused_k = [5, 0];
        let leftpad = [2, 0];
        let table = SequenceTable::resolve(&SequenceSpec {
            batch_size: 2,
            seqlen_q: 2,
            seqlen_k: 8,
            total_q: 4,
            total_k: 16,
            seqused_k: Some(&seqused_k),
            leftpad_k: Some(&leftpad),
            seqlen_k_new: 2,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            *table.row(0),
            BatchSequence {
                q_offset: 0,
                q_len: 2,
                k_offset: 2,
                k_len: 5,
                k_len_og: 3,
                leftpad_k: 2,
            }
        );
        assert_eq!(table.row(1).k_len, 2);
    }

    #[test]
    fn test_leftpad_beyond_used_keys() {
        let seqused_k = [1];
        let leftpad = [2];
        let error = SequenceTable::resolve(&SequenceSpec {
            batch_size: 1,
            seqlen_q: 1,
            seqlen_k: 8,
            total_q: 1,
            total_k: 8,
            seqused_k: Some(&seqused_k),
            leftpad_k: Some(&leftpad),
            ..Default::default()
        })
        .unwrap_err();
        assert_eq!(
            error,
            ContractError::UsedLengthOverflow {
                name: "leftpad_k",
                index: 0,
                used: 2,
                length: 1,
            }
        );
    }
}
