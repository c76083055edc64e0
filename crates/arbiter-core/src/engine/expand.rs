use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;

use crate::schema::{PermissionExpr, Schema};
use crate::snapshot::SnapshotToken;
use crate::tuple::{EntityRef, SubjectRef, TupleFilter};

use super::evaluator::{EngineFuture, TraversalPath, indirect_targets};
use super::{EngineConfig, EngineError, TupleReader};

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub entity: EntityRef,
    pub permission: String,
    pub snapshot: SnapshotToken,
}

/// A subject stored on a relation. A subject set naming a relation carries
/// its stored members (one level deep); one naming a permission carries the
/// expansion of that permission instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpandedSubject {
    pub subject: SubjectRef,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<SubjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expansion: Option<Box<ExpandTree>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpandTree {
    Union {
        children: Vec<ExpandTree>,
    },
    Intersection {
        children: Vec<ExpandTree>,
    },
    Exclusion {
        include: Box<ExpandTree>,
        exclude: Box<ExpandTree>,
    },
    Leaf {
        entity: EntityRef,
        relation: String,
        subjects: Vec<ExpandedSubject>,
        truncated: bool,
    },
    Indirect {
        relation: String,
        permission: String,
        children: Vec<ExpandTree>,
    },
    Rule {
        entity: EntityRef,
        rule: String,
    },
    Cycle {
        entity: EntityRef,
        name: String,
    },
}

pub struct ExpandEngine<T: TupleReader> {
    reader: Arc<T>,
    schema: Arc<Schema>,
    config: EngineConfig,
}

impl<T: TupleReader> ExpandEngine<T> {
    pub fn new(reader: Arc<T>, schema: Arc<Schema>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            config,
        }
    }

    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandTree, EngineError> {
        let type_def = self
            .schema
            .get_type(&request.entity.entity_type)
            .ok_or_else(|| EngineError::TypeNotFound(request.entity.entity_type.clone()))?;

        if type_def.get_permission(&request.permission).is_none()
            && type_def.get_relation(&request.permission).is_none()
        {
            return Err(EngineError::PermissionNotFound {
                type_name: request.entity.entity_type.clone(),
                permission: request.permission.clone(),
            });
        }

        self.expand_named(
            &request.entity,
            &request.permission,
            &request.snapshot,
            &TraversalPath::default(),
        )
        .await
    }

    fn expand_named<'a>(
        &'a self,
        entity: &'a EntityRef,
        name: &'a str,
        snapshot: &'a SnapshotToken,
        path: &'a TraversalPath,
    ) -> EngineFuture<'a, ExpandTree> {
        Box::pin(async move {
            let Some(path) = path.enter(entity, name, self.config.max_depth)? else {
                tracing::debug!(entity = %entity, name, "expand reached a cycle");
                return Ok(ExpandTree::Cycle {
                    entity: entity.clone(),
                    name: name.to_string(),
                });
            };

            let type_def = self
                .schema
                .get_type(&entity.entity_type)
                .ok_or_else(|| EngineError::TypeNotFound(entity.entity_type.clone()))?;

            if let Some(perm_def) = type_def.get_permission(name) {
                return self
                    .expand_expr(&perm_def.expression, entity, snapshot, &path)
                    .await;
            }

            if type_def.get_relation(name).is_some() {
                return self.expand_leaf(entity, name, snapshot, &path).await;
            }

            Err(EngineError::RelationNotFound {
                type_name: entity.entity_type.clone(),
                relation: name.to_string(),
            })
        })
    }

    fn expand_expr<'a>(
        &'a self,
        expr: &'a PermissionExpr,
        entity: &'a EntityRef,
        snapshot: &'a SnapshotToken,
        path: &'a TraversalPath,
    ) -> EngineFuture<'a, ExpandTree> {
        Box::pin(async move {
            match expr {
                PermissionExpr::Leaf(name) => {
                    self.expand_named(entity, name, snapshot, path).await
                }
                PermissionExpr::Rule(rule) => {
                    if self.schema.get_rule(rule).is_none() {
                        return Err(EngineError::RuleNotFound(rule.clone()));
                    }
                    Ok(ExpandTree::Rule {
                        entity: entity.clone(),
                        rule: rule.clone(),
                    })
                }
                PermissionExpr::Union(children) => {
                    let children = self
                        .expand_children(children, entity, snapshot, path)
                        .await?;
                    Ok(ExpandTree::Union { children })
                }
                PermissionExpr::Intersection(children) => {
                    let children = self
                        .expand_children(children, entity, snapshot, path)
                        .await?;
                    Ok(ExpandTree::Intersection { children })
                }
                PermissionExpr::Exclusion(include, exclude) => {
                    let (include, exclude) = futures::try_join!(
                        self.expand_expr(include, entity, snapshot, path),
                        self.expand_expr(exclude, entity, snapshot, path),
                    )?;
                    Ok(ExpandTree::Exclusion {
                        include: Box::new(include),
                        exclude: Box::new(exclude),
                    })
                }
                PermissionExpr::Indirect(relation, permission) => {
                    self.expand_indirect(relation, permission, entity, snapshot, path)
                        .await
                }
            }
        })
    }

    /// Expands siblings concurrently while keeping their schema order.
    async fn expand_children(
        &self,
        children: &[PermissionExpr],
        entity: &EntityRef,
        snapshot: &SnapshotToken,
        path: &TraversalPath,
    ) -> Result<Vec<ExpandTree>, EngineError> {
        let branches: Vec<_> = children
            .iter()
            .map(|child| self.expand_expr(child, entity, snapshot, path))
            .collect();
        stream::iter(branches)
            .buffered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await
    }

    async fn expand_leaf(
        &self,
        entity: &EntityRef,
        relation: &str,
        snapshot: &SnapshotToken,
        path: &TraversalPath,
    ) -> Result<ExpandTree, EngineError> {
        let filter = TupleFilter::for_relation(entity, relation);
        let tuples = self.reader.read_tuples(&filter, snapshot).await?;

        let mut budget = self.config.max_expand_subjects;
        let mut truncated = false;
        let mut subjects = Vec::new();

        for tuple in tuples {
            if budget == 0 {
                truncated = true;
                break;
            }
            budget -= 1;

            let mut members = Vec::new();
            if let Some(ref rel) = tuple.subject.subject_relation {
                let set = tuple.subject.entity();
                let names_permission = self
                    .schema
                    .get_type(&set.entity_type)
                    .is_some_and(|t| t.get_permission(rel).is_some());
                if names_permission {
                    let tree = self.expand_named(&set, rel, snapshot, path).await?;
                    subjects.push(ExpandedSubject {
                        subject: tuple.subject,
                        members: Vec::new(),
                        expansion: Some(Box::new(tree)),
                    });
                    continue;
                }

                let member_filter = TupleFilter::for_relation(&set, rel);
                let member_tuples = self.reader.read_tuples(&member_filter, snapshot).await?;
                if member_tuples.len() > budget {
                    truncated = true;
                }
                members.extend(member_tuples.into_iter().take(budget).map(|t| t.subject));
                budget -= members.len();
            }

            subjects.push(ExpandedSubject {
                subject: tuple.subject,
                members,
                expansion: None,
            });
        }

        if truncated {
            tracing::debug!(
                entity = %entity,
                relation,
                limit = self.config.max_expand_subjects,
                "expand leaf truncated"
            );
        }

        Ok(ExpandTree::Leaf {
            entity: entity.clone(),
            relation: relation.to_string(),
            subjects,
            truncated,
        })
    }

    async fn expand_indirect(
        &self,
        relation: &str,
        permission: &str,
        entity: &EntityRef,
        snapshot: &SnapshotToken,
        path: &TraversalPath,
    ) -> Result<ExpandTree, EngineError> {
        let filter = TupleFilter::for_relation(entity, relation);
        let tuples = self.reader.read_tuples(&filter, snapshot).await?;
        let targets = indirect_targets(&self.schema, &tuples, permission);

        let branches: Vec<_> = targets
            .iter()
            .map(|target| self.expand_named(target, permission, snapshot, path))
            .collect();
        let children = stream::iter(branches)
            .buffered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await?;

        Ok(ExpandTree::Indirect {
            relation: relation.to_string(),
            permission: permission.to_string(),
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{TestStore, drive_schema, parse_entity, parse_subject, snapshot, tuple};
    use crate::schema::TypeDefinition;

    fn make_expand_engine(schema: Schema, store: TestStore) -> ExpandEngine<TestStore> {
        ExpandEngine::new(Arc::new(store), Arc::new(schema), EngineConfig::default())
    }

    fn request(entity: &str, permission: &str) -> ExpandRequest {
        ExpandRequest {
            entity: parse_entity(entity),
            permission: permission.to_string(),
            snapshot: snapshot(),
        }
    }

    fn direct(raw: &str) -> ExpandedSubject {
        ExpandedSubject {
            subject: parse_subject(raw),
            members: vec![],
            expansion: None,
        }
    }

    #[tokio::test]
    async fn expand_rejects_unknown_type() {
        let engine = make_expand_engine(Schema::default(), TestStore::default());

        let err = engine.expand(&request("document:readme", "view")).await.unwrap_err();
        assert!(matches!(err, EngineError::TypeNotFound(ref t) if t == "document"));
    }

    #[tokio::test]
    async fn expand_rejects_unknown_permission() {
        let engine = make_expand_engine(drive_schema(), TestStore::default());

        let err = engine.expand(&request("document:readme", "nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::PermissionNotFound { .. }));
    }

    #[tokio::test]
    async fn expand_drive_lists_group_members() {
        let store = TestStore::new(vec![
            tuple("drive:eng_drive", "member", "group:engineering#member"),
            tuple("drive:eng_drive", "member", "user:zed"),
            tuple("group:engineering", "member", "user:alice"),
            tuple("group:engineering", "member", "user:bob"),
        ]);
        let engine = make_expand_engine(drive_schema(), store);

        let tree = engine.expand(&request("drive:eng_drive", "view")).await.unwrap();

        assert_eq!(
            tree,
            ExpandTree::Leaf {
                entity: parse_entity("drive:eng_drive"),
                relation: "member".to_string(),
                subjects: vec![
                    ExpandedSubject {
                        subject: parse_subject("group:engineering#member"),
                        members: vec![parse_subject("user:alice"), parse_subject("user:bob")],
                        expansion: None,
                    },
                    direct("user:zed"),
                ],
                truncated: false,
            }
        );
    }

    #[tokio::test]
    async fn expand_mirrors_expression_structure() {
        let store = TestStore::new(vec![
            tuple("document:readme", "owner", "user:alice"),
            tuple("document:readme", "parent", "folder:root"),
            tuple("folder:root", "viewer", "user:bob"),
            tuple("document:readme", "banned", "user:mallory"),
        ]);
        let engine = make_expand_engine(drive_schema(), store);

        let tree = engine.expand(&request("document:readme", "view")).await.unwrap();

        let ExpandTree::Exclusion { include, exclude } = tree else {
            panic!("expected exclusion, got: {tree:?}");
        };
        assert!(matches!(
            *exclude,
            ExpandTree::Leaf { ref relation, ref subjects, .. }
                if relation == "banned" && subjects == &vec![direct("user:mallory")]
        ));

        let ExpandTree::Union { children } = *include else {
            panic!("expected union under include");
        };
        assert_eq!(children.len(), 2);
        assert!(matches!(children[0], ExpandTree::Union { ref children } if children.len() == 2));

        let ExpandTree::Indirect { ref relation, ref permission, ref children } = children[1] else {
            panic!("expected indirect, got: {:?}", children[1]);
        };
        assert_eq!(relation, "parent");
        assert_eq!(permission, "view");
        assert_eq!(children.len(), 1);

        let ExpandTree::Union { children: ref folder } = children[0] else {
            panic!("expected folder union, got: {:?}", children[0]);
        };
        assert!(matches!(
            folder[1],
            ExpandTree::Leaf { ref subjects, .. } if subjects == &vec![direct("user:bob")]
        ));
        assert_eq!(
            folder[2],
            ExpandTree::Rule {
                entity: parse_entity("folder:root"),
                rule: "is_public".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn expand_subject_set_naming_a_permission_carries_its_expansion() {
        let schema = Schema {
            types: vec![
                TypeDefinition::new("user"),
                TypeDefinition::new("group")
                    .with_relation("member", &["user"])
                    .with_permission("all", PermissionExpr::leaf("member")),
                TypeDefinition::new("drive").with_relation("member", &["group#all"]),
            ],
            rules: vec![],
        };
        let store = TestStore::new(vec![
            tuple("drive:d", "member", "group:eng#all"),
            tuple("group:eng", "member", "user:alice"),
        ]);
        let engine = make_expand_engine(schema, store);

        let tree = engine.expand(&request("drive:d", "member")).await.unwrap();

        assert_eq!(
            tree,
            ExpandTree::Leaf {
                entity: parse_entity("drive:d"),
                relation: "member".to_string(),
                subjects: vec![ExpandedSubject {
                    subject: parse_subject("group:eng#all"),
                    members: vec![],
                    expansion: Some(Box::new(ExpandTree::Leaf {
                        entity: parse_entity("group:eng"),
                        relation: "member".to_string(),
                        subjects: vec![direct("user:alice")],
                        truncated: false,
                    })),
                }],
                truncated: false,
            }
        );
    }

    #[tokio::test]
    async fn expand_truncates_large_leaves() {
        let mut tuples = vec![tuple("drive:big", "member", "group:all#member")];
        for i in 0..10 {
            tuples.push(tuple("group:all", "member", &format!("user:u{i}")));
        }
        let engine = ExpandEngine::new(
            Arc::new(TestStore::new(tuples)),
            Arc::new(drive_schema()),
            EngineConfig {
                max_expand_subjects: 4,
                ..EngineConfig::default()
            },
        );

        let tree = engine.expand(&request("drive:big", "member")).await.unwrap();

        let ExpandTree::Leaf { subjects, truncated, .. } = tree else {
            panic!("expected leaf");
        };
        assert!(truncated);
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].members.len(), 3);
    }

    #[tokio::test]
    async fn expand_marks_self_reference_as_cycle() {
        let schema = Schema {
            types: vec![
                TypeDefinition::new("user"),
                TypeDefinition::new("node")
                    .with_relation("owner", &["user"])
                    .with_permission(
                        "manage",
                        PermissionExpr::Union(vec![
                            PermissionExpr::leaf("owner"),
                            PermissionExpr::leaf("manage"),
                        ]),
                    ),
            ],
            rules: vec![],
        };
        let engine = make_expand_engine(schema, TestStore::default());

        let tree = engine.expand(&request("node:1", "manage")).await.unwrap();

        let ExpandTree::Union { children } = tree else {
            panic!("expected union");
        };
        assert_eq!(
            children[1],
            ExpandTree::Cycle {
                entity: parse_entity("node:1"),
                name: "manage".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn expand_tree_serializes_with_kind_tags() {
        let store = TestStore::new(vec![tuple("drive:d", "member", "user:alice")]);
        let engine = make_expand_engine(drive_schema(), store);

        let tree = engine.expand(&request("drive:d", "view")).await.unwrap();
        let json = serde_json::to_value(&tree).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "kind": "leaf",
                "entity": {"type": "drive", "id": "d"},
                "relation": "member",
                "subjects": [{"subject": {"type": "user", "id": "alice"}}],
                "truncated": false
            })
        );
    }
}
