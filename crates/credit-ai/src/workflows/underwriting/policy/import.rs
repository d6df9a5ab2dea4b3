use std::io::Read;

use serde::{Deserialize, Deserializer};

use super::{PolicyDocument, PolicyError, PolicyMetadata};

/// Parse a policy corpus CSV (`document_id,title,section,page,regulation,text`).
///
/// Rows sharing a `document_id` are joined in file order into one document; metadata comes
/// from the first row of each document.
pub fn parse_policy_csv<R: Read>(reader: R) -> Result<Vec<PolicyDocument>, PolicyError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut documents: Vec<PolicyDocument> = Vec::new();

    for record in csv_reader.deserialize::<PolicyRow>() {
        let row = record.map_err(|err| PolicyError::Import(err.to_string()))?;
        if row.document_id.is_empty() {
            return Err(PolicyError::Import("row without document_id".to_string()));
        }
        match documents
            .iter_mut()
            .find(|document| document.document_id == row.document_id)
        {
            Some(document) => {
                document.text.push_str("\n\n");
                document.text.push_str(&row.text);
            }
            None => documents.push(PolicyDocument {
                document_id: row.document_id,
                text: row.text,
                metadata: PolicyMetadata {
                    title: row.title,
                    section: row.section,
                    page: row.page,
                    regulation: row.regulation,
                },
            }),
        }
    }

    Ok(documents)
}

#[derive(Debug, Deserialize)]
struct PolicyRow {
    document_id: String,
    title: String,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    section: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default, deserialize_with = "empty_string_as_none")]
    regulation: Option<String>,
    text: String,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|raw| !raw.trim().is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_rows_by_document() {
        let csv = "document_id,title,section,page,regulation,text\n\
                   pojk-33,Prudential Lending,Pasal 5,12,POJK 33/2018,Borrowers must be 21.\n\
                   pojk-33,Prudential Lending,Pasal 6,13,POJK 33/2018,LTV must not exceed 80%.\n\
                   int-01,Internal Credit Policy,,,,DTI above 40% is not permitted.\n";

        let documents = parse_policy_csv(csv.as_bytes()).expect("csv parses");

        assert_eq!(documents.len(), 2);
        assert_eq!(documents[0].document_id, "pojk-33");
        assert_eq!(
            documents[0].text,
            "Borrowers must be 21.\n\nLTV must not exceed 80%."
        );
        assert_eq!(documents[0].metadata.page, Some(12));
        assert_eq!(documents[1].metadata.section, None);
        assert_eq!(documents[1].metadata.regulation, None);
    }
}
