use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Create sources table
        manager
            .create_table(
                Table::create()
                    .table(Sources::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sources::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sources::Name).string().not_null())
                    .col(ColumnDef::new(Sources::Description).string())
                    .col(ColumnDef::new(Sources::Metadata).text())
                    .col(ColumnDef::new(Sources::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Sources::UpdatedAt).timestamp().not_null())
                    .index(
                        Index::create()
                            .name("idx_sources_name")
                            .table(Sources::Table)
                            .col(Sources::Name)
                            .unique(),
                    )
                    .to_owned(),
            )
            .await?;

        // Create languages table
        manager
            .create_table(
                Table::create()
                    .table(Languages::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Languages::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Languages::Name).string().not_null())
                    .col(ColumnDef::new(Languages::Url).string())
                    .col(ColumnDef::new(Languages::AltNames).text())
                    .col(ColumnDef::new(Languages::Metadata).text())
                    .col(ColumnDef::new(Languages::SourceId).integer().not_null())
                    .col(ColumnDef::new(Languages::SourceRef).string())
                    .col(ColumnDef::new(Languages::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Languages::UpdatedAt).timestamp().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_languages_source_id")
                            .from(Languages::Table, Languages::SourceId)
                            .to(Sources::Table, Sources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Lookup index only: refs repeat in dirty source data, and duplicates
        // are collapsed at ingest time rather than rejected here
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_languages_source_ref")
                    .table(Languages::Table)
                    .col(Languages::SourceId)
                    .col(Languages::SourceRef)
                    .to_owned(),
            )
            .await?;

        // Create places table
        manager
            .create_table(
                Table::create()
                    .table(Places::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Places::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Places::Category)
                            .string()
                            .not_null()
                            .default("unknown"),
                    )
                    .col(ColumnDef::new(Places::Location).text())
                    .col(ColumnDef::new(Places::LocationDesc).text())
                    .col(ColumnDef::new(Places::Description).text())
                    .col(
                        ColumnDef::new(Places::IsPublic)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(ColumnDef::new(Places::Metadata).text())
                    .col(ColumnDef::new(Places::SourceId).integer().not_null())
                    .col(ColumnDef::new(Places::SourceRef).string())
                    .col(ColumnDef::new(Places::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Places::UpdatedAt).timestamp().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_places_source_id")
                            .from(Places::Table, Places::SourceId)
                            .to(Sources::Table, Sources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_places_source_ref")
                    .table(Places::Table)
                    .col(Places::SourceId)
                    .col(Places::SourceRef)
                    .to_owned(),
            )
            .await?;

        // Create words table
        manager
            .create_table(
                Table::create()
                    .table(Words::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Words::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Words::PlaceId).integer())
                    .col(ColumnDef::new(Words::Name).string().not_null())
                    .col(ColumnDef::new(Words::Description).text())
                    .col(ColumnDef::new(Words::LanguageId).integer().not_null())
                    .col(ColumnDef::new(Words::Metadata).text())
                    .col(ColumnDef::new(Words::SourceId).integer().not_null())
                    .col(ColumnDef::new(Words::SourceRef).string())
                    .col(ColumnDef::new(Words::CreatedAt).timestamp().not_null())
                    .col(ColumnDef::new(Words::UpdatedAt).timestamp().not_null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_words_place_id")
                            .from(Words::Table, Words::PlaceId)
                            .to(Places::Table, Places::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_words_language_id")
                            .from(Words::Table, Words::LanguageId)
                            .to(Languages::Table, Languages::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_words_source_id")
                            .from(Words::Table, Words::SourceId)
                            .to(Sources::Table, Sources::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_words_source_ref")
                    .table(Words::Table)
                    .col(Words::SourceId)
                    .col(Words::SourceRef)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Words::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Places::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Languages::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sources::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(Iden)]
enum Sources {
    Table,
    Id,
    Name,
    Description,
    Metadata,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Languages {
    Table,
    Id,
    Name,
    Url,
    AltNames,
    Metadata,
    SourceId,
    SourceRef,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Places {
    Table,
    Id,
    Category,
    Location,
    LocationDesc,
    Description,
    IsPublic,
    Metadata,
    SourceId,
    SourceRef,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Words {
    Table,
    Id,
    PlaceId,
    Name,
    Description,
    LanguageId,
    Metadata,
    SourceId,
    SourceRef,
    CreatedAt,
    UpdatedAt,
}
