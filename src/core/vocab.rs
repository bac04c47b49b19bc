//! IRIs the projection relies on

use oxigraph::model::NamedNode;

pub const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";
pub const RDFS_LABEL: &str = "http://www.w3.org/2000/01/rdf-schema#label";

pub const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";
pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
pub const RDF_LANG_STRING: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#langString";

/// Marks an entity as deleted; deleted entities are removed from the views
pub const FS_DATE_DELETED: &str = "https://fairspace.nl/ontology#dateDeleted";

pub fn rdf_type() -> NamedNode {
    NamedNode::new_unchecked(RDF_TYPE)
}

pub fn rdfs_label() -> NamedNode {
    NamedNode::new_unchecked(RDFS_LABEL)
}

pub fn date_deleted() -> NamedNode {
    NamedNode::new_unchecked(FS_DATE_DELETED)
}
